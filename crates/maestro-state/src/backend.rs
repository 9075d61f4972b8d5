use crate::scope::{Scope, VersionedEntry};
use async_trait::async_trait;
use maestro_core::MaestroResult;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Backing store behind the [`StateManager`](crate::StateManager).
///
/// Any store offering atomic single-key upserts, per-scope key listing, and a
/// full read at start-up satisfies this contract. Writes carry a version;
/// implementations keep only the highest version per (scope, key), treating a
/// removal as a versioned tombstone.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether a successful write survives a process restart.
    fn is_durable(&self) -> bool {
        true
    }

    /// Read every live entry, in insertion order.
    async fn load(&self) -> MaestroResult<Vec<VersionedEntry>>;

    /// Atomically replace the (scope, key) mapping unless a newer version is
    /// already stored.
    async fn upsert(&self, record: &VersionedEntry) -> MaestroResult<()>;

    /// Remove the (scope, key) mapping unless a newer version is stored.
    async fn remove(&self, scope: &Scope, key: &str, version: u64) -> MaestroResult<()>;

    /// Live keys stored under `scope`.
    async fn keys(&self, scope: &Scope) -> MaestroResult<Vec<String>>;

    /// Highest version seen so far, tombstones included. A manager resumes its
    /// version clock above this after a restart.
    async fn max_version(&self) -> MaestroResult<u64>;

    /// Discard whatever is stored (quarantining it if possible) and start
    /// over empty. Called after [`load`](Self::load) fails.
    async fn reset(&self) -> MaestroResult<()>;
}

#[derive(Debug, Clone)]
struct Slot {
    version: u64,
    record: Option<VersionedEntry>,
}

/// Highest-version-wins index shared by the in-process backends.
#[derive(Debug, Default)]
pub(crate) struct VersionIndex {
    slots: HashMap<(Scope, String), Slot>,
    max_version: u64,
}

impl VersionIndex {
    /// Apply a put. Returns `false` if a newer write was already applied.
    pub(crate) fn put(&mut self, record: VersionedEntry) -> bool {
        let key = (record.entry.scope.clone(), record.entry.key.clone());
        self.max_version = self.max_version.max(record.version);
        match self.slots.get(&key) {
            Some(slot) if slot.version >= record.version => false,
            _ => {
                self.slots.insert(
                    key,
                    Slot {
                        version: record.version,
                        record: Some(record),
                    },
                );
                true
            }
        }
    }

    /// Apply a removal. Returns `false` if a newer write was already applied.
    pub(crate) fn remove(&mut self, scope: &Scope, key: &str, version: u64) -> bool {
        let slot_key = (scope.clone(), key.to_string());
        self.max_version = self.max_version.max(version);
        match self.slots.get(&slot_key) {
            Some(slot) if slot.version >= version => false,
            _ => {
                self.slots.insert(
                    slot_key,
                    Slot {
                        version,
                        record: None,
                    },
                );
                true
            }
        }
    }

    /// Live entries ordered by insertion position.
    pub(crate) fn live(&self) -> Vec<VersionedEntry> {
        let mut live: Vec<VersionedEntry> = self
            .slots
            .values()
            .filter_map(|s| s.record.clone())
            .collect();
        live.sort_by_key(|r| r.position);
        live
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.values().filter(|s| s.record.is_some()).count()
    }

    pub(crate) fn keys(&self, scope: &Scope) -> Vec<String> {
        let mut keys: Vec<(u64, String)> = self
            .slots
            .iter()
            .filter(|((s, _), _)| s == scope)
            .filter_map(|((_, k), slot)| slot.record.as_ref().map(|r| (r.position, k.clone())))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, k)| k).collect()
    }

    pub(crate) fn max_version(&self) -> u64 {
        self.max_version
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.max_version = 0;
    }
}

/// Non-durable backend that keeps everything in process memory.
///
/// Useful for tests and ephemeral deployments. Sharing one instance between
/// two managers simulates a restart without touching the filesystem.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    index: Mutex<VersionIndex>,
}

impl MemoryBackend {
    /// Create an empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn load(&self) -> MaestroResult<Vec<VersionedEntry>> {
        Ok(self.index.lock().live())
    }

    async fn upsert(&self, record: &VersionedEntry) -> MaestroResult<()> {
        self.index.lock().put(record.clone());
        Ok(())
    }

    async fn remove(&self, scope: &Scope, key: &str, version: u64) -> MaestroResult<()> {
        self.index.lock().remove(scope, key, version);
        Ok(())
    }

    async fn keys(&self, scope: &Scope) -> MaestroResult<Vec<String>> {
        Ok(self.index.lock().keys(scope))
    }

    async fn max_version(&self) -> MaestroResult<u64> {
        Ok(self.index.lock().max_version())
    }

    async fn reset(&self) -> MaestroResult<()> {
        self.index.lock().clear();
        Ok(())
    }
}
