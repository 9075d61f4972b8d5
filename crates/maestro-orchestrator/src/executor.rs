use crate::handler::{AgentHandler, CancellationSignal, HandlerError, HandlerRegistry, TaskContext};
use crate::monitor::AgentMonitor;
use crate::task_queue::{FailOutcome, TaskQueue};
use crate::types::{Task, TaskStatus};
use chrono::Utc;
use futures_util::FutureExt;
use maestro_core::{MaestroError, MaestroResult, MessageBus, MessageKind};
use maestro_state::StateManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bus topics published by the orchestrator.
pub mod topics {
    /// A run left the CREATED state (EVENT).
    pub const RUN_STARTED: &str = "maestro.run.started";
    /// A run reached a terminal status (RESULT).
    pub const RUN_FINISHED: &str = "maestro.run.finished";
    /// A task was handed to its handler (COMMAND).
    pub const TASK_DISPATCHED: &str = "maestro.task.dispatched";
    /// A task completed (RESULT).
    pub const TASK_COMPLETED: &str = "maestro.task.completed";
    /// A failed attempt was scheduled for retry (EVENT).
    pub const TASK_RETRYING: &str = "maestro.task.retrying";
    /// A task failed for good (ERROR).
    pub const TASK_FAILED: &str = "maestro.task.failed";
}

const SENDER_ID: &str = "executor";

/// The `[executor]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Deadline for a handler call when the task sets none.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Upper bound on concurrently running handler calls.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Fallback wake-up interval while waiting for a task to settle.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_idle_poll_ms() -> u64 {
    50
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: default_task_timeout_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl ExecutorConfig {
    /// Reject settings that cannot work.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(MaestroError::Config(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(MaestroError::Config("task_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Dispatches queued tasks to registered handlers.
///
/// Waiting for a task and running tasks are the same loop: whoever waits on a
/// task for agent `a` also drains `a`'s queue, so every outstanding task has
/// at least one driver and handler calls for independent tasks overlap.
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    queue: Arc<TaskQueue>,
    state: Arc<StateManager>,
    bus: Arc<MessageBus>,
    monitor: Arc<AgentMonitor>,
    config: ExecutorConfig,
    permits: Semaphore,
    runs: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl Executor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        queue: Arc<TaskQueue>,
        state: Arc<StateManager>,
        bus: Arc<MessageBus>,
        monitor: Arc<AgentMonitor>,
        config: ExecutorConfig,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent_tasks.max(1));
        Self {
            registry,
            queue,
            state,
            bus,
            monitor,
            config,
            permits,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Open a cancellation channel for `run_id`.
    pub fn register_run(&self, run_id: Uuid) -> CancellationSignal {
        let mut runs = self.runs.lock();
        let tx = runs
            .entry(run_id)
            .or_insert_with(|| watch::channel(false).0);
        CancellationSignal::new(tx.subscribe())
    }

    /// Signal cancellation to `run_id`'s handlers and stop its queued tasks.
    pub async fn cancel_run(&self, run_id: Uuid) {
        if let Some(tx) = self.runs.lock().get(&run_id) {
            tx.send_replace(true);
        }
        self.queue.cancel_run(run_id).await;
        // Released while cancelling; nothing will release it again.
        if !self.runs.lock().contains_key(&run_id) {
            self.queue.forget_run(run_id);
        }
    }

    /// Drop the cancellation channel and queue marker of a finished run.
    pub fn release_run(&self, run_id: Uuid) {
        self.runs.lock().remove(&run_id);
        self.queue.forget_run(run_id);
    }

    fn signal_for(&self, run_id: Option<Uuid>) -> CancellationSignal {
        run_id
            .and_then(|id| self.runs.lock().get(&id).map(watch::Sender::subscribe))
            .map_or_else(CancellationSignal::never, CancellationSignal::new)
    }

    /// Drive `task_id` to a terminal status and return its final record.
    ///
    /// While waiting, the caller executes whatever its agent's queue hands
    /// out, so the task may be run by this call or by a concurrent one.
    pub async fn run_to_completion(&self, task_id: Uuid) -> MaestroResult<Task> {
        let agent = self.queue.status(task_id)?.target_agent;
        let idle = Duration::from_millis(self.config.idle_poll_ms.max(1));

        loop {
            let changed = self.queue.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let task = self.queue.status(task_id)?;
            if task.is_terminal() {
                return Ok(task);
            }

            if matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
                let permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| MaestroError::Handler(format!("executor shut down: {e}")))?;
                let next = self.queue.dequeue(&agent).await?;
                if let Some(next) = next {
                    self.execute(next).await;
                    drop(permit);
                    continue;
                }
                drop(permit);
            }

            let wait = self
                .queue
                .next_due(&agent)
                .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(idle))
                .unwrap_or(idle);
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Run one dequeued task and record its outcome.
    async fn execute(&self, task: Task) {
        let agent = task.target_agent.clone();
        let correlation = task
            .correlation_id
            .clone()
            .unwrap_or_else(|| task.id.to_string());

        info!(
            task_id = %task.id,
            run_id = ?task.run_id,
            agent = %agent,
            attempt = task.attempt_count,
            "Dispatching task"
        );
        self.monitor.start_task(&agent, task.id).await;
        self.bus.publish(
            topics::TASK_DISPATCHED,
            SENDER_ID,
            MessageKind::Command,
            json!({
                "task_id": task.id,
                "run_id": task.run_id,
                "agent": agent,
                "task_type": task.task_type,
                "attempt": task.attempt_count,
            }),
            correlation.as_str(),
        );

        let start = Instant::now();
        let outcome = match self.registry.get(&agent) {
            Some(handler) => self.invoke(Arc::clone(handler), &task).await,
            None => Err(HandlerError::unknown_agent(&agent)),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => self.settle_success(&task, output, duration_ms, &correlation).await,
            Err(err) => self.settle_failure(&task, err, duration_ms, &correlation).await,
        }
    }

    async fn invoke(&self, handler: Arc<dyn AgentHandler>, task: &Task) -> Result<Value, HandlerError> {
        let ctx = TaskContext {
            task_id: task.id,
            run_id: task.run_id,
            correlation_id: task.correlation_id.clone(),
            attempt: task.attempt_count,
            context: task.context.clone(),
            cancellation: self.signal_for(task.run_id),
        };
        let limit = Duration::from_millis(task.timeout_ms.unwrap_or(self.config.task_timeout_ms));
        let call = AssertUnwindSafe(handler.invoke(&task.payload, &ctx)).catch_unwind();

        match tokio::time::timeout(limit, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(HandlerError::timeout(format!(
                "handler for '{}' exceeded {} ms",
                task.target_agent,
                limit.as_millis()
            ))),
        }
    }

    async fn settle_success(&self, task: &Task, output: Value, duration_ms: u64, correlation: &str) {
        match self.queue.complete(task.id, output).await {
            Ok(done) if done.status == TaskStatus::Completed => {
                self.monitor
                    .finish_task(&task.target_agent, task.id, duration_ms)
                    .await;
                debug!(task_id = %task.id, agent = %task.target_agent, duration_ms, "Task completed");
                self.bus.publish(
                    topics::TASK_COMPLETED,
                    SENDER_ID,
                    MessageKind::Result,
                    json!({
                        "task_id": task.id,
                        "run_id": task.run_id,
                        "agent": task.target_agent,
                        "output": done.output,
                    }),
                    correlation,
                );
            }
            Ok(_) => {
                // Cancelled while the handler ran; the output is discarded.
                self.monitor
                    .finish_task(&task.target_agent, task.id, duration_ms)
                    .await;
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Could not record task completion");
                self.monitor
                    .record_error(&task.target_agent, task.id, duration_ms)
                    .await;
            }
        }
    }

    async fn settle_failure(&self, task: &Task, err: HandlerError, duration_ms: u64, correlation: &str) {
        match self.queue.fail(task.id, err.clone()).await {
            Ok(FailOutcome::Retrying { attempt, delay }) => {
                self.monitor
                    .record_retry(&task.target_agent, task.id, duration_ms)
                    .await;
                self.bus.publish(
                    topics::TASK_RETRYING,
                    SENDER_ID,
                    MessageKind::Event,
                    json!({
                        "task_id": task.id,
                        "run_id": task.run_id,
                        "agent": task.target_agent,
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "error": err,
                    }),
                    correlation,
                );
            }
            Ok(outcome) => {
                if outcome == FailOutcome::Failed {
                    warn!(task_id = %task.id, agent = %task.target_agent, error = %err, "Task failed terminally");
                }
                self.monitor
                    .record_error(&task.target_agent, task.id, duration_ms)
                    .await;
                self.bus.publish(
                    topics::TASK_FAILED,
                    SENDER_ID,
                    MessageKind::Error,
                    json!({
                        "task_id": task.id,
                        "run_id": task.run_id,
                        "agent": task.target_agent,
                        "error": err,
                        "cancelled": outcome == FailOutcome::Cancelled,
                    }),
                    correlation,
                );
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Could not record task failure");
                self.monitor
                    .record_error(&task.target_agent, task.id, duration_ms)
                    .await;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
