use crate::backend::{MemoryBackend, StateBackend};
use crate::jsonl::JsonlBackend;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which backing store the state manager writes through to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Append-only JSON-lines log.
    #[default]
    Jsonl,
    /// Embedded SQLite database (requires the `sqlite` feature).
    Sqlite,
    /// Process memory only; nothing survives a restart.
    Memory,
}

/// The `[state]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Backing store kind.
    #[serde(default)]
    pub backend: BackendKind,
    /// Storage path; defaults to `state.jsonl` or `state.db` in the data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// JSONL log length that triggers compaction.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,
}

fn default_compact_threshold() -> usize {
    1024
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: None,
            compact_threshold: default_compact_threshold(),
        }
    }
}

impl StateConfig {
    /// Resolve the storage path against `data_dir`.
    pub fn resolved_path(&self, data_dir: &Path) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        match self.backend {
            BackendKind::Sqlite => data_dir.join("state.db"),
            _ => data_dir.join("state.jsonl"),
        }
    }
}

/// Build the backend described by `config`.
pub async fn open_backend(
    config: &StateConfig,
    data_dir: &Path,
) -> MaestroResult<Arc<dyn StateBackend>> {
    let path = config.resolved_path(data_dir);
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendKind::Jsonl => Ok(Arc::new(JsonlBackend::new(path, config.compact_threshold))),
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => Ok(Arc::new(crate::sqlite::SqliteBackend::open(path).await?)),
        #[cfg(not(feature = "sqlite"))]
        BackendKind::Sqlite => Err(MaestroError::Config(format!(
            "sqlite state backend requested for {} but maestro-state was built without the `sqlite` feature",
            path.display()
        ))),
    }
}
