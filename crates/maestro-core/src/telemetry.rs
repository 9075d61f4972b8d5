use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Logging settings, usually read from the `[logging]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit one JSON object per line instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed (e.g. by a test
/// harness or the host process), in which case nothing changes.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::debug!(filter = %config.filter, json = config.json, "Tracing initialized");
    }
    installed
}
