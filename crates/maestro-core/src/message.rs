use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a [`Message`] represents to its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// An instruction for some component to act.
    Command,
    /// A notification that something happened.
    Event,
    /// The successful outcome of a unit of work.
    Result,
    /// The failed outcome of a unit of work.
    Error,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
            MessageKind::Result => write!(f, "result"),
            MessageKind::Error => write!(f, "error"),
        }
    }
}

/// A single message published on the [`MessageBus`](crate::MessageBus).
///
/// Messages are immutable once published; subscribers receive them behind an
/// `Arc` so fan-out never copies the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Topic the message was published on.
    pub topic: String,
    /// Identifier of the publishing component or agent.
    pub sender_id: String,
    /// What the message represents.
    pub kind: MessageKind,
    /// Opaque structured payload.
    pub payload: serde_json::Value,
    /// Identifier shared by every message of one workflow run.
    pub correlation_id: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a new message stamped with a fresh id and the current time.
    pub fn new(
        topic: impl Into<String>,
        sender_id: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            sender_id: sender_id.into(),
            kind,
            payload,
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Creates an [`MessageKind::Event`] message.
    pub fn event(
        topic: impl Into<String>,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::new(topic, sender_id, MessageKind::Event, payload, correlation_id)
    }

    /// Creates a [`MessageKind::Command`] message.
    pub fn command(
        topic: impl Into<String>,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::new(topic, sender_id, MessageKind::Command, payload, correlation_id)
    }
}
