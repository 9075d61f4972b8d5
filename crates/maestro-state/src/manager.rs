use crate::backend::{MemoryBackend, StateBackend};
use crate::scope::{Scope, StateEntry, VersionedEntry};
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    updated_at: DateTime<Utc>,
    version: u64,
    position: u64,
}

#[derive(Debug)]
enum PendingOp {
    Put(VersionedEntry),
    Remove { scope: Scope, key: String, version: u64 },
}

/// A change already visible in memory whose flush to the backend is still
/// outstanding.
///
/// Produced by [`StateManager::stage`] so that callers holding a synchronous
/// lock can make a change visible atomically and flush it once the lock is
/// released. Dropping it without calling [`commit`](Self::commit) leaves the
/// change in memory only.
#[must_use = "a staged write is not durable until committed"]
pub struct PendingWrite {
    backend: Arc<dyn StateBackend>,
    degraded: Arc<AtomicBool>,
    op: PendingOp,
}

impl PendingWrite {
    /// Flush the change. On failure the in-memory value stays in place and the
    /// manager is marked degraded.
    pub async fn commit(self) -> MaestroResult<()> {
        let result = match &self.op {
            PendingOp::Put(record) => self.backend.upsert(record).await,
            PendingOp::Remove {
                scope,
                key,
                version,
            } => self.backend.remove(scope, key, *version).await,
        };
        result.map_err(|e| {
            let (scope, key) = match &self.op {
                PendingOp::Put(r) => (&r.entry.scope, r.entry.key.as_str()),
                PendingOp::Remove { scope, key, .. } => (scope, key.as_str()),
            };
            if !self.degraded.swap(true, Ordering::SeqCst) {
                warn!(
                    backend = self.backend.name(),
                    scope = %scope,
                    key,
                    error = %e,
                    "State flush failed, continuing in memory only"
                );
            }
            match e {
                MaestroError::Persistence(msg) => MaestroError::Persistence(msg),
                other => MaestroError::Persistence(format!("flush of {scope}/{key} failed: {other}")),
            }
        })
    }
}

/// Scoped key/value store with an authoritative in-memory copy and a
/// write-through backend.
///
/// Reads never touch the backend. Writes to different keys only contend on a
/// short in-memory critical section; same-key writers race and the last one to
/// take that section wins, both in memory and on disk (every write carries a
/// version and backends keep the highest).
pub struct StateManager {
    backend: Arc<dyn StateBackend>,
    entries: RwLock<HashMap<Scope, HashMap<String, Slot>>>,
    clock: AtomicU64,
    degraded: Arc<AtomicBool>,
}

impl StateManager {
    /// Rebuild state from `backend`.
    ///
    /// Never fails: if the backend cannot be read it is reset (quarantining
    /// what it held where possible) and the manager starts empty.
    pub async fn open(backend: Arc<dyn StateBackend>) -> Self {
        let degraded = Arc::new(AtomicBool::new(false));
        let records = match backend.load().await {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    backend = backend.name(),
                    error = %e,
                    "State storage unreadable, starting with empty state"
                );
                if let Err(reset_err) = backend.reset().await {
                    warn!(backend = backend.name(), error = %reset_err, "State storage reset failed");
                    degraded.store(true, Ordering::SeqCst);
                }
                Vec::new()
            }
        };

        let mut clock = backend.max_version().await.unwrap_or(0);
        let mut entries: HashMap<Scope, HashMap<String, Slot>> = HashMap::new();
        for record in &records {
            clock = clock.max(record.version);
            entries.entry(record.entry.scope.clone()).or_default().insert(
                record.entry.key.clone(),
                Slot {
                    value: record.entry.value.clone(),
                    updated_at: record.entry.updated_at,
                    version: record.version,
                    position: record.position,
                },
            );
        }

        info!(
            backend = backend.name(),
            durable = backend.is_durable(),
            entries = records.len(),
            "State manager ready"
        );

        Self {
            backend,
            entries: RwLock::new(entries),
            clock: AtomicU64::new(clock),
            degraded,
        }
    }

    /// A manager backed only by process memory.
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Whether a flush has failed since start-up.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn pending(&self, op: PendingOp) -> PendingWrite {
        PendingWrite {
            backend: Arc::clone(&self.backend),
            degraded: Arc::clone(&self.degraded),
            op,
        }
    }

    /// Replace the (scope, key) mapping in memory and return the flush.
    pub fn stage(&self, scope: Scope, key: impl Into<String>, value: Value) -> PendingWrite {
        let key = key.into();
        let now = Utc::now();
        let mut entries = self.entries.write();
        let version = self.next_version();
        let keys = entries.entry(scope.clone()).or_default();
        let position = keys.get(&key).map_or(version, |s| s.position);
        keys.insert(
            key.clone(),
            Slot {
                value: value.clone(),
                updated_at: now,
                version,
                position,
            },
        );
        drop(entries);

        self.pending(PendingOp::Put(VersionedEntry {
            entry: StateEntry {
                key,
                value,
                scope,
                updated_at: now,
            },
            version,
            position,
        }))
    }

    /// Remove the (scope, key) mapping in memory and return the flush, or
    /// `None` if the key was absent.
    pub fn stage_delete(&self, scope: &Scope, key: &str) -> Option<PendingWrite> {
        let mut entries = self.entries.write();
        let keys = entries.get_mut(scope)?;
        keys.remove(key)?;
        if keys.is_empty() {
            entries.remove(scope);
        }
        let version = self.next_version();
        drop(entries);

        Some(self.pending(PendingOp::Remove {
            scope: scope.clone(),
            key: key.to_string(),
            version,
        }))
    }

    /// Atomic upsert. A successful return means the value has been flushed.
    pub async fn set(&self, scope: Scope, key: impl Into<String>, value: Value) -> MaestroResult<()> {
        self.stage(scope, key, value).commit().await
    }

    /// Serialize and store `value`.
    pub async fn set_as<T: Serialize>(
        &self,
        scope: Scope,
        key: impl Into<String>,
        value: &T,
    ) -> MaestroResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(scope, key, value).await
    }

    /// Value stored under (scope, key).
    pub fn get(&self, scope: &Scope, key: &str) -> MaestroResult<Value> {
        self.entries
            .read()
            .get(scope)
            .and_then(|keys| keys.get(key))
            .map(|slot| slot.value.clone())
            .ok_or_else(|| MaestroError::NotFound(format!("state key {scope}/{key}")))
    }

    /// Deserialize the value stored under (scope, key).
    pub fn get_as<T: DeserializeOwned>(&self, scope: &Scope, key: &str) -> MaestroResult<T> {
        Ok(serde_json::from_value(self.get(scope, key)?)?)
    }

    /// Full entry stored under (scope, key), if any.
    pub fn get_entry(&self, scope: &Scope, key: &str) -> Option<StateEntry> {
        let entries = self.entries.read();
        let slot = entries.get(scope)?.get(key)?;
        Some(StateEntry {
            key: key.to_string(),
            value: slot.value.clone(),
            scope: scope.clone(),
            updated_at: slot.updated_at,
        })
    }

    /// Whether (scope, key) is present.
    pub fn contains(&self, scope: &Scope, key: &str) -> bool {
        self.entries
            .read()
            .get(scope)
            .is_some_and(|keys| keys.contains_key(key))
    }

    /// Remove (scope, key). Returns whether it existed.
    pub async fn delete(&self, scope: &Scope, key: &str) -> MaestroResult<bool> {
        match self.stage_delete(scope, key) {
            Some(pending) => {
                pending.commit().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace (scope, key) with `new` only if its current value equals
    /// `expected` (`None` meaning absent). Returns whether the swap happened.
    pub async fn compare_and_swap(
        &self,
        scope: Scope,
        key: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> MaestroResult<bool> {
        let pending = {
            let entries = self.entries.upgradable_read();
            let current = entries.get(&scope).and_then(|keys| keys.get(key));
            if current.map(|s| &s.value) != expected {
                return Ok(false);
            }
            let mut entries = parking_lot::RwLockUpgradableReadGuard::upgrade(entries);
            let version = self.next_version();
            let now = Utc::now();
            let keys = entries.entry(scope.clone()).or_default();
            let position = keys.get(key).map_or(version, |s| s.position);
            keys.insert(
                key.to_string(),
                Slot {
                    value: new.clone(),
                    updated_at: now,
                    version,
                    position,
                },
            );
            self.pending(PendingOp::Put(VersionedEntry {
                entry: StateEntry {
                    key: key.to_string(),
                    value: new,
                    scope,
                    updated_at: now,
                },
                version,
                position,
            }))
        };
        pending.commit().await?;
        Ok(true)
    }

    /// Every (key, value) in `scope`, in insertion order. A snapshot: later
    /// writes are not reflected.
    pub fn list(&self, scope: &Scope) -> Vec<(String, Value)> {
        self.entries(scope)
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect()
    }

    /// Every entry in `scope`, in insertion order.
    pub fn entries(&self, scope: &Scope) -> Vec<StateEntry> {
        let entries = self.entries.read();
        let Some(keys) = entries.get(scope) else {
            return Vec::new();
        };
        let mut slots: Vec<(&String, &Slot)> = keys.iter().collect();
        slots.sort_by_key(|(_, s)| s.position);
        slots
            .into_iter()
            .map(|(key, slot)| StateEntry {
                key: key.clone(),
                value: slot.value.clone(),
                scope: scope.clone(),
                updated_at: slot.updated_at,
            })
            .collect()
    }

    /// Scopes that currently hold at least one key.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self.entries.read().keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Number of keys across all scopes.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    /// Whether no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every key in `scope`. Returns how many were removed.
    pub async fn clear_scope(&self, scope: &Scope) -> MaestroResult<usize> {
        let keys: Vec<String> = self.list(scope).into_iter().map(|(k, _)| k).collect();
        let mut removed = 0;
        for key in keys {
            if self.delete(scope, &key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every key in every scope.
    pub async fn clear_all(&self) -> MaestroResult<usize> {
        let mut removed = 0;
        for scope in self.scopes() {
            removed += self.clear_scope(&scope).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    /// Backend whose writes always fail.
    struct BrokenBackend;

    #[async_trait]
    impl StateBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn load(&self) -> MaestroResult<Vec<VersionedEntry>> {
            Err(MaestroError::Persistence("unreadable".into()))
        }
        async fn upsert(&self, _record: &VersionedEntry) -> MaestroResult<()> {
            Err(MaestroError::Io(std::io::Error::other("disk full")))
        }
        async fn remove(&self, _scope: &Scope, _key: &str, _version: u64) -> MaestroResult<()> {
            Err(MaestroError::Persistence("disk full".into()))
        }
        async fn keys(&self, _scope: &Scope) -> MaestroResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn max_version(&self) -> MaestroResult<u64> {
            Ok(0)
        }
        async fn reset(&self) -> MaestroResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let state = StateManager::in_memory();
        state.set(Scope::Global, "mode", json!("audit")).await.unwrap();
        assert_eq!(state.get(&Scope::Global, "mode").unwrap(), json!("audit"));
        assert!(matches!(
            state.get(&Scope::Global, "missing"),
            Err(MaestroError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let state = StateManager::in_memory();
        state.set(Scope::agent("a"), "k", json!(1)).await.unwrap();
        state.set(Scope::agent("b"), "k", json!(2)).await.unwrap();
        assert_eq!(state.get(&Scope::agent("a"), "k").unwrap(), json!(1));
        assert_eq!(state.get(&Scope::agent("b"), "k").unwrap(), json!(2));
        assert_eq!(state.scopes().len(), 2);
    }

    #[tokio::test]
    async fn test_list_in_insertion_order() {
        let state = StateManager::in_memory();
        for key in ["c", "a", "b"] {
            state.set(Scope::Global, key, json!(key)).await.unwrap();
        }
        // Overwriting keeps the original position.
        state.set(Scope::Global, "c", json!("c2")).await.unwrap();
        let keys: Vec<String> = state.list(&Scope::Global).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let state = StateManager::in_memory();
        state.set(Scope::Global, "k", json!(1)).await.unwrap();
        assert!(state.delete(&Scope::Global, "k").await.unwrap());
        assert!(!state.delete(&Scope::Global, "k").await.unwrap());
        assert!(!state.contains(&Scope::Global, "k"));
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Progress {
            done: u32,
        }
        let state = StateManager::in_memory();
        state
            .set_as(Scope::agent("scanner"), "progress", &Progress { done: 3 })
            .await
            .unwrap();
        let got: Progress = state.get_as(&Scope::agent("scanner"), "progress").unwrap();
        assert_eq!(got, Progress { done: 3 });
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let state = StateManager::in_memory();
        assert!(state
            .compare_and_swap(Scope::Global, "n", None, json!(1))
            .await
            .unwrap());
        assert!(!state
            .compare_and_swap(Scope::Global, "n", None, json!(2))
            .await
            .unwrap());
        assert!(state
            .compare_and_swap(Scope::Global, "n", Some(&json!(1)), json!(2))
            .await
            .unwrap());
        assert_eq!(state.get(&Scope::Global, "n").unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_clear_scope_and_all() {
        let state = StateManager::in_memory();
        state.set(Scope::agent("a"), "x", json!(1)).await.unwrap();
        state.set(Scope::agent("a"), "y", json!(2)).await.unwrap();
        state.set(Scope::Global, "z", json!(3)).await.unwrap();
        assert_eq!(state.clear_scope(&Scope::agent("a")).await.unwrap(), 2);
        assert_eq!(state.len(), 1);
        assert_eq!(state.clear_all().await.unwrap(), 1);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_backend_starts_empty_and_degrades_on_flush() {
        let state = StateManager::open(Arc::new(BrokenBackend)).await;
        assert!(state.is_empty());
        assert!(!state.is_degraded());

        let err = state.set(Scope::Global, "k", json!(1)).await.unwrap_err();
        assert!(matches!(err, MaestroError::Persistence(_)));
        assert!(state.is_degraded());
        // The in-memory value is kept.
        assert_eq!(state.get(&Scope::Global, "k").unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_reopen_from_shared_backend() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let first = StateManager::open(Arc::clone(&backend)).await;
        first.set(Scope::Global, "kept", json!("v")).await.unwrap();
        first.set(Scope::Global, "gone", json!("v")).await.unwrap();
        first.delete(&Scope::Global, "gone").await.unwrap();
        drop(first);

        let second = StateManager::open(Arc::clone(&backend)).await;
        assert_eq!(second.get(&Scope::Global, "kept").unwrap(), json!("v"));
        assert!(!second.contains(&Scope::Global, "gone"));

        // A write after restart must outrank the stored tombstone.
        second.set(Scope::Global, "gone", json!("back")).await.unwrap();
        let third = StateManager::open(backend).await;
        assert_eq!(third.get(&Scope::Global, "gone").unwrap(), json!("back"));
    }

    #[tokio::test]
    async fn test_staged_write_is_visible_before_commit() {
        let state = StateManager::in_memory();
        let pending = state.stage(Scope::Global, "k", json!(1));
        assert_eq!(state.get(&Scope::Global, "k").unwrap(), json!(1));
        pending.commit().await.unwrap();
    }
}
