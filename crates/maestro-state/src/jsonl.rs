use crate::backend::{StateBackend, VersionIndex};
use crate::scope::{Scope, VersionedEntry};
use async_trait::async_trait;
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One line of the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Put {
        #[serde(flatten)]
        record: VersionedEntry,
    },
    Delete {
        scope: Scope,
        key: String,
        version: u64,
    },
}

#[derive(Default)]
struct LogState {
    file: Option<tokio::fs::File>,
    index: VersionIndex,
    lines: usize,
}

/// Write-through, append-only JSON-lines log.
///
/// Every upsert or removal appends one line and is `fsync`ed before the call
/// returns. Once the log holds more than `compact_threshold` lines and at least
/// twice as many lines as live keys, it is rewritten as a snapshot through a
/// temporary file and an atomic rename.
pub struct JsonlBackend {
    path: PathBuf,
    compact_threshold: usize,
    state: Mutex<LogState>,
}

impl JsonlBackend {
    /// Create a backend writing to `path`. Nothing is touched until
    /// [`load`](StateBackend::load).
    pub fn new(path: impl Into<PathBuf>, compact_threshold: usize) -> Self {
        Self {
            path: path.into(),
            compact_threshold: compact_threshold.max(1),
            state: Mutex::new(LogState::default()),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open_append(&self) -> MaestroResult<tokio::fs::File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?)
    }

    async fn append(&self, state: &mut LogState, record: &LogRecord) -> MaestroResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if state.file.is_none() {
            state.file = Some(self.open_append().await?);
        }
        let Some(file) = state.file.as_mut() else {
            return Err(MaestroError::Persistence("state log is not open".into()));
        };
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            // Drop the handle so the next write reopens the file.
            state.file = None;
            return Err(MaestroError::Persistence(format!(
                "append to {} failed: {e}",
                self.path.display()
            )));
        }
        state.lines += 1;

        if state.lines > self.compact_threshold && state.lines >= 2 * state.index.live_count().max(1) {
            self.compact(state).await?;
        }
        Ok(())
    }

    /// Rewrite the log as one `put` line per live entry.
    async fn compact(&self, state: &mut LogState) -> MaestroResult<()> {
        let live = state.index.live();
        let mut body = String::new();
        for record in &live {
            body.push_str(&serde_json::to_string(&LogRecord::Put {
                record: record.clone(),
            })?);
            body.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(body.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
        }
        state.file = None;
        tokio::fs::rename(&tmp, &self.path).await?;
        state.file = Some(self.open_append().await?);

        debug!(
            path = %self.path.display(),
            before = state.lines,
            after = live.len(),
            "State log compacted"
        );
        state.lines = live.len();
        Ok(())
    }
}

/// Parse the log body. A malformed final line without a trailing newline is a
/// write that never completed and is dropped; anything else malformed is
/// corruption.
fn parse_log(path: &Path, body: &str) -> MaestroResult<(VersionIndex, usize, bool)> {
    let mut index = VersionIndex::default();
    let mut lines = 0usize;
    let mut torn_tail = false;
    let total = body.lines().count();

    for (n, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(line) {
            Ok(LogRecord::Put { record }) => {
                index.put(record);
            }
            Ok(LogRecord::Delete {
                scope,
                key,
                version,
            }) => {
                index.remove(&scope, &key, version);
            }
            Err(e) if n + 1 == total && !body.ends_with('\n') => {
                warn!(path = %path.display(), line = n + 1, error = %e, "Dropping torn final state log line");
                torn_tail = true;
                continue;
            }
            Err(e) => {
                return Err(MaestroError::Persistence(format!(
                    "corrupt state log {} at line {}: {e}",
                    path.display(),
                    n + 1
                )));
            }
        }
        lines += 1;
    }
    Ok((index, lines, torn_tail))
}

#[async_trait]
impl StateBackend for JsonlBackend {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn load(&self) -> MaestroResult<Vec<VersionedEntry>> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(MaestroError::Persistence(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let (index, lines, torn_tail) = parse_log(&self.path, &body)?;
        let mut state = self.state.lock().await;
        state.index = index;
        state.lines = lines;
        state.file = None;
        let unterminated = !body.is_empty() && !body.ends_with('\n');
        if torn_tail || unterminated {
            // Rewrite so the next append starts on a fresh line.
            self.compact(&mut state).await?;
        }

        let live = state.index.live();
        info!(path = %self.path.display(), entries = live.len(), "State log loaded");
        Ok(live)
    }

    async fn upsert(&self, record: &VersionedEntry) -> MaestroResult<()> {
        let mut state = self.state.lock().await;
        if !state.index.put(record.clone()) {
            // A newer write is already durable.
            return Ok(());
        }
        self.append(
            &mut state,
            &LogRecord::Put {
                record: record.clone(),
            },
        )
        .await
    }

    async fn remove(&self, scope: &Scope, key: &str, version: u64) -> MaestroResult<()> {
        let mut state = self.state.lock().await;
        if !state.index.remove(scope, key, version) {
            return Ok(());
        }
        self.append(
            &mut state,
            &LogRecord::Delete {
                scope: scope.clone(),
                key: key.to_string(),
                version,
            },
        )
        .await
    }

    async fn keys(&self, scope: &Scope) -> MaestroResult<Vec<String>> {
        Ok(self.state.lock().await.index.keys(scope))
    }

    async fn max_version(&self) -> MaestroResult<u64> {
        Ok(self.state.lock().await.index.max_version())
    }

    async fn reset(&self) -> MaestroResult<()> {
        let mut state = self.state.lock().await;
        state.file = None;
        state.index.clear();
        state.lines = 0;

        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            let quarantine = self.path.with_extension(format!(
                "jsonl.corrupt-{}",
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            tokio::fs::rename(&self.path, &quarantine).await?;
            warn!(
                path = %self.path.display(),
                quarantine = %quarantine.display(),
                "Quarantined unreadable state log"
            );
        }
        Ok(())
    }
}
