//! Durable, scoped key/value state for Maestro.
//!
//! The [`StateManager`] keeps an authoritative in-memory copy of every entry
//! and writes each change through to a pluggable [`StateBackend`]. On start it
//! rebuilds itself from the backend before serving any read; unreadable
//! storage is quarantined and the manager starts empty instead of failing.
//!
//! # Main types
//!
//! - [`Scope`] — Global, per-agent, or per-task namespace for keys.
//! - [`StateEntry`] — A single value with its scope and last update time.
//! - [`StateManager`] — Concurrent get/set/delete/list over all scopes.
//! - [`StateBackend`] — Persistence contract; see [`JsonlBackend`],
//!   [`MemoryBackend`], and (with the `sqlite` feature) `SqliteBackend`.

/// Persistence contract and the in-memory backend.
pub mod backend;
/// `[state]` configuration section and backend selection.
pub mod config;
/// Append-only JSON-lines backend.
pub mod jsonl;
/// The state manager itself.
pub mod manager;
/// Scopes and entry types.
pub mod scope;
/// SQLite backend.
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use backend::{MemoryBackend, StateBackend};
pub use config::{open_backend, BackendKind, StateConfig};
pub use jsonl::JsonlBackend;
pub use manager::{PendingWrite, StateManager};
pub use scope::{Scope, StateEntry, VersionedEntry};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
