use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Broad class of a handler failure. Drives the default retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// The handler exceeded its execution deadline.
    Timeout,
    /// A transient I/O or upstream failure.
    Transient,
    /// The handler rejected the work; retrying will not help.
    Logic,
    /// The run was cancelled while the handler was working.
    Cancelled,
    /// No handler is registered for the target agent.
    UnknownAgent,
    /// The handler panicked.
    Panicked,
}

impl std::fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandlerErrorKind::Timeout => "timeout",
            HandlerErrorKind::Transient => "transient",
            HandlerErrorKind::Logic => "logic",
            HandlerErrorKind::Cancelled => "cancelled",
            HandlerErrorKind::UnknownAgent => "unknown_agent",
            HandlerErrorKind::Panicked => "panicked",
        };
        write!(f, "{s}")
    }
}

/// Failure reported by (or on behalf of) an agent handler.
///
/// These are values recorded in a run's result map, never `MaestroError`s.
/// `recoverable` lets a handler override the retry policy's default for its
/// kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Failure class.
    pub kind: HandlerErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Explicit retry classification, if the handler made one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
}

impl HandlerError {
    /// Build an error of the given kind.
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: None,
        }
    }

    /// A deadline was exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Timeout, message)
    }

    /// A transient failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Transient, message)
    }

    /// A permanent failure in the handler's own logic.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Logic, message)
    }

    /// The run was cancelled.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Cancelled, message)
    }

    /// No handler is registered under `agent`.
    pub fn unknown_agent(agent: &str) -> Self {
        Self::new(
            HandlerErrorKind::UnknownAgent,
            format!("no handler registered for agent '{agent}'"),
        )
        .with_recoverable(false)
    }

    /// The handler panicked.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Panicked, message)
    }

    /// Override the retry policy for this failure.
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = Some(recoverable);
        self
    }
}

/// Cooperative cancellation flag handed to handlers.
///
/// Handlers are never killed on cancellation; long-running ones should check
/// [`is_cancelled`](Self::is_cancelled) between units of work or race their
/// work against [`cancelled`](Self::cancelled).
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// Wrap the receiving side of a cancellation channel.
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the sender
    /// goes away without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything a handler learns about the task it is running besides its
/// payload.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Id of the task being executed.
    pub task_id: Uuid,
    /// Run the task belongs to, if any.
    pub run_id: Option<Uuid>,
    /// Correlation id shared by every task and message of the run.
    pub correlation_id: Option<String>,
    /// Retries so far; `0` on the first execution.
    pub attempt: u32,
    /// Accumulated workflow context.
    pub context: Value,
    /// Cancellation flag of the owning run.
    pub cancellation: CancellationSignal,
}

impl TaskContext {
    /// A context for invoking a handler outside of any run.
    pub fn detached(context: Value) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            run_id: None,
            correlation_id: None,
            attempt: 0,
            context,
            cancellation: CancellationSignal::never(),
        }
    }
}

/// The single capability every agent exposes to the orchestrator.
///
/// Implementations must be safe to invoke concurrently for different tasks.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Run one task.
    async fn invoke(&self, payload: &Value, ctx: &TaskContext) -> Result<Value, HandlerError>;
}

struct FnAgent<F>(F);

#[async_trait]
impl<F, Fut> AgentHandler for FnAgent<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn invoke(&self, payload: &Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
        (self.0)(payload.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as an [`AgentHandler`].
pub fn agent_fn<F, Fut>(f: F) -> Arc<dyn AgentHandler>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnAgent(f))
}

/// Static mapping from agent name to its handler.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn AgentHandler>) {
        let name = name.into();
        info!(agent = %name, "Registered agent handler");
        self.handlers.insert(name, handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn AgentHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered agent names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_agent_fn_invokes_closure() {
        let echo = agent_fn(|payload, ctx| async move {
            Ok(json!({"payload": payload, "context": ctx.context}))
        });
        let out = echo
            .invoke(&json!("hi"), &TaskContext::detached(json!({"k": 1})))
            .await
            .unwrap();
        assert_eq!(out, json!({"payload": "hi", "context": {"k": 1}}));
    }

    #[test]
    fn test_registry() {
        let registry = HandlerRegistry::new()
            .with("scan", agent_fn(|_, _| async { Ok(Value::Null) }))
            .with("match", agent_fn(|_, _| async { Ok(Value::Null) }));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("scan"));
        assert!(registry.get("report").is_none());
        assert_eq!(registry.names(), vec!["match", "scan"]);
    }

    #[test]
    fn test_handler_error_display_and_serde() {
        let err = HandlerError::transient("connection reset");
        assert_eq!(err.to_string(), "transient: connection reset");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, json!({"kind": "transient", "message": "connection reset"}));

        let unknown = HandlerError::unknown_agent("ghost");
        assert_eq!(unknown.recoverable, Some(false));
        assert_eq!(unknown.kind, HandlerErrorKind::UnknownAgent);
    }

    #[tokio::test]
    async fn test_cancellation_signal() {
        let (tx, rx) = watch::channel(false);
        let signal = CancellationSignal::new(rx);
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_cancelled());
        assert!(!CancellationSignal::never().is_cancelled());
    }
}
