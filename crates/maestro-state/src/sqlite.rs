use crate::backend::StateBackend;
use crate::scope::{Scope, StateEntry, VersionedEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS state (
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL,
    position INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (scope, key)
);
CREATE INDEX IF NOT EXISTS idx_state_position ON state(position);
"#;

type Row = (String, String, String, String, i64, i64);

/// State backend on an embedded SQLite database.
///
/// One row per (scope, key); removals are kept as tombstone rows so a late
/// flush of an older version cannot resurrect a deleted key.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

fn sql_err(e: rusqlite::Error) -> MaestroError {
    MaestroError::Persistence(format!("sqlite: {e}"))
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`.
    ///
    /// A file that is not a usable database is moved aside as
    /// `<name>.corrupt-<timestamp>` and a fresh database is created in its
    /// place.
    pub async fn open(path: impl AsRef<Path>) -> MaestroResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = match Self::connect(&path).await? {
            Ok(conn) => conn,
            Err(e) => {
                let quarantine = quarantine_path(&path);
                tokio::fs::rename(&path, &quarantine).await?;
                for suffix in ["-wal", "-shm"] {
                    let sidecar = sidecar_path(&path, suffix);
                    if tokio::fs::try_exists(&sidecar).await.unwrap_or(false) {
                        tokio::fs::rename(&sidecar, sidecar_path(&quarantine, suffix)).await?;
                    }
                }
                warn!(
                    path = %path.display(),
                    quarantine = %quarantine.display(),
                    error = %e,
                    "Quarantined unreadable state database"
                );
                Self::connect(&path).await?.map_err(sql_err)?
            }
        };

        info!(path = %path.display(), "SQLite state backend opened");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn connect(path: &Path) -> MaestroResult<rusqlite::Result<Connection>> {
        let db_path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| MaestroError::Persistence(format!("sqlite worker failed: {e}")))
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> MaestroResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| MaestroError::Persistence(format!("sqlite worker failed: {e}")))?
        .map_err(sql_err)
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn quarantine_path(path: &Path) -> PathBuf {
    sidecar_path(path, &format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")))
}

fn decode(row: Row) -> MaestroResult<VersionedEntry> {
    let (scope, key, value, updated_at, version, position) = row;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| MaestroError::Persistence(format!("bad timestamp for {scope}/{key}: {e}")))?
        .with_timezone(&Utc);
    Ok(VersionedEntry {
        entry: StateEntry {
            value: serde_json::from_str(&value)?,
            scope: scope.parse()?,
            key,
            updated_at,
        },
        version: u64::try_from(version).unwrap_or_default(),
        position: u64::try_from(position).unwrap_or_default(),
    })
}

#[async_trait]
impl StateBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self) -> MaestroResult<Vec<VersionedEntry>> {
        let rows: Vec<Row> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT scope, key, value, updated_at, version, position FROM state \
                     WHERE deleted = 0 ORDER BY position",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
                })?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(decode).collect()
    }

    async fn upsert(&self, record: &VersionedEntry) -> MaestroResult<()> {
        let scope = record.entry.scope.to_string();
        let key = record.entry.key.clone();
        let value = serde_json::to_string(&record.entry.value)?;
        let updated_at = record.entry.updated_at.to_rfc3339();
        let version = i64::try_from(record.version)
            .map_err(|_| MaestroError::Persistence("version overflow".into()))?;
        let position = i64::try_from(record.position)
            .map_err(|_| MaestroError::Persistence("position overflow".into()))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO state (scope, key, value, updated_at, version, position, deleted) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0) \
                 ON CONFLICT(scope, key) DO UPDATE SET \
                   value = excluded.value, updated_at = excluded.updated_at, \
                   version = excluded.version, position = excluded.position, deleted = 0 \
                 WHERE excluded.version > state.version",
                params![scope, key, value, updated_at, version, position],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove(&self, scope: &Scope, key: &str, version: u64) -> MaestroResult<()> {
        let scope = scope.to_string();
        let key = key.to_string();
        let now = Utc::now().to_rfc3339();
        let version = i64::try_from(version)
            .map_err(|_| MaestroError::Persistence("version overflow".into()))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO state (scope, key, value, updated_at, version, position, deleted) \
                 VALUES (?1, ?2, NULL, ?3, ?4, ?4, 1) \
                 ON CONFLICT(scope, key) DO UPDATE SET \
                   value = NULL, updated_at = excluded.updated_at, \
                   version = excluded.version, deleted = 1 \
                 WHERE excluded.version > state.version",
                params![scope, key, now, version],
            )
            .map(|_| ())
        })
        .await
    }

    async fn keys(&self, scope: &Scope) -> MaestroResult<Vec<String>> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM state WHERE scope = ?1 AND deleted = 0 ORDER BY position",
            )?;
            let keys = stmt.query_map([scope], |r| r.get(0))?;
            keys.collect()
        })
        .await
    }

    async fn max_version(&self) -> MaestroResult<u64> {
        let max: Option<i64> = self
            .with_conn(|conn| conn.query_row("SELECT MAX(version) FROM state", [], |r| r.get(0)))
            .await?;
        Ok(max.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }

    async fn reset(&self) -> MaestroResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS state;")?;
            conn.execute_batch(SCHEMA)
        })
        .await
    }
}
