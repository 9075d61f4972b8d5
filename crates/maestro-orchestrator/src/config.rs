//! `maestro.toml` loading.
//!
//! Every section is optional; a missing section takes its defaults, so an
//! empty file is a valid configuration.

use crate::executor::ExecutorConfig;
use crate::retry::RetryPolicy;
use maestro_core::{BusConfig, LogConfig, MaestroError, MaestroResult};
use maestro_state::StateConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Full configuration of one orchestrator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaestroConfig {
    /// Directory that relative storage paths are resolved against.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub queue: RetryPolicy,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state: StateConfig::default(),
            queue: RetryPolicy::default(),
            executor: ExecutorConfig::default(),
            bus: BusConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl MaestroConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> MaestroResult<Self> {
        let config: MaestroConfig = toml::from_str(content)
            .map_err(|e| MaestroError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> MaestroResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MaestroError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), backend = ?config.state.backend, "Config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> MaestroResult<()> {
        self.queue.validate()?;
        self.executor.validate()?;
        if self.state.compact_threshold == 0 {
            return Err(MaestroError::Config(
                "state.compact_threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Where the state backend stores its data.
    pub fn state_path(&self) -> PathBuf {
        self.state.resolved_path(&self.data_dir)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_state::BackendKind;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = MaestroConfig::from_toml_str("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.state.backend, BackendKind::Jsonl);
        assert_eq!(config.queue.default_max_attempts, 3);
        assert_eq!(config.executor.max_concurrent_tasks, 5);
        assert_eq!(config.bus.history_capacity, 1000);
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.state_path(), PathBuf::from("./data/state.jsonl"));
    }

    #[test]
    fn test_partial_sections() {
        let config = MaestroConfig::from_toml_str(
            r#"
data_dir = "/var/lib/maestro"

[state]
backend = "memory"

[queue]
default_max_attempts = 5
backoff_base_ms = 10

[executor]
max_concurrent_tasks = 16

[logging]
json = true
"#,
        )
        .unwrap();
        assert_eq!(config.state.backend, BackendKind::Memory);
        assert_eq!(config.queue.default_max_attempts, 5);
        assert_eq!(config.queue.backoff_base_ms, 10);
        assert_eq!(config.queue.backoff_max_ms, 30_000);
        assert_eq!(config.executor.max_concurrent_tasks, 16);
        assert_eq!(config.executor.task_timeout_ms, 300_000);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = MaestroConfig::from_toml_str("[executor]\nmax_concurrent_tasks = 0\n").unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));

        let err = MaestroConfig::from_toml_str(
            "[queue]\nbackoff_base_ms = 5000\nbackoff_max_ms = 100\n",
        )
        .unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));

        let err = MaestroConfig::from_toml_str("[state]\nbackend = \"redis\"\n").unwrap_err();
        assert!(matches!(err, MaestroError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "[bus]\nhistory_capacity = 0").unwrap();
        let config = MaestroConfig::load(tmp.path()).unwrap();
        assert_eq!(config.bus.history_capacity, 0);

        let missing = MaestroConfig::load(Path::new("/nonexistent/maestro.toml"));
        assert!(matches!(missing, Err(MaestroError::Config(_))));
    }
}
