use chrono::{DateTime, Utc};
use maestro_core::MaestroError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Namespace a state key lives in. Keys are unique within a scope.
///
/// Serialized as a compact string (`global`, `agent:<id>`, `task:<uuid>`) so
/// backends can store and prefix-match it directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scope {
    /// Process-wide state.
    Global,
    /// Context owned by one agent.
    Agent(String),
    /// Status owned by one task.
    Task(Uuid),
}

impl Scope {
    /// Shorthand for [`Scope::Agent`].
    pub fn agent(id: impl Into<String>) -> Self {
        Scope::Agent(id.into())
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Agent(id) => write!(f, "agent:{id}"),
            Scope::Task(id) => write!(f, "task:{id}"),
        }
    }
}

impl FromStr for Scope {
    type Err = MaestroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Scope::Global);
        }
        if let Some(id) = s.strip_prefix("agent:") {
            if !id.is_empty() {
                return Ok(Scope::Agent(id.to_string()));
            }
        }
        if let Some(id) = s.strip_prefix("task:") {
            let id = Uuid::parse_str(id)
                .map_err(|e| MaestroError::Persistence(format!("invalid task scope '{s}': {e}")))?;
            return Ok(Scope::Task(id));
        }
        Err(MaestroError::Persistence(format!("invalid scope '{s}'")))
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = MaestroError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Key, unique within `scope`.
    pub key: String,
    /// Opaque structured value.
    pub value: serde_json::Value,
    /// Namespace of the key.
    pub scope: Scope,
    /// Time of the last replace.
    pub updated_at: DateTime<Utc>,
}

/// A [`StateEntry`] as handed to a backend.
///
/// `version` orders writes across the whole process: a backend must keep the
/// highest version it has seen for a (scope, key) and ignore older ones, which
/// lets concurrent flushes land in any order. `position` is the version at
/// which the key was first inserted and gives listings their insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    /// The stored entry.
    pub entry: StateEntry,
    /// Write version.
    pub version: u64,
    /// Insertion order.
    pub position: u64,
}
