use crate::handler::HandlerError;
use crate::retry::RetryPolicy;
use crate::types::{Task, TaskPriority, TaskRequest, TaskStatus};
use chrono::{DateTime, Utc};
use maestro_core::{MaestroError, MaestroResult};
use maestro_state::{PendingWrite, Scope, StateManager};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Key under which each task's record is stored in its `Scope::Task` scope.
pub const TASK_RECORD_KEY: &str = "record";

/// Dequeue order within one agent: priority-major, creation-minor.
type ReadyKey = (Reverse<TaskPriority>, u64, Uuid);

/// What a call to [`TaskQueue::fail`] did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Terminally failed.
    Failed,
    /// Its run was cancelled; the failure ends the task without a retry.
    Cancelled,
}

#[derive(Default)]
struct QueueInner {
    tasks: HashMap<Uuid, Task>,
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    delayed: HashMap<String, BTreeSet<(DateTime<Utc>, Uuid)>>,
    cancelled_runs: HashSet<Uuid>,
    next_sequence: u64,
}

impl QueueInner {
    fn push_ready(&mut self, task: &Task) {
        self.ready
            .entry(task.target_agent.clone())
            .or_default()
            .insert((Reverse(task.priority), task.sequence, task.id));
    }

    /// Move retrying tasks of `agent` whose backoff has elapsed back to
    /// pending. Returns the promoted tasks.
    fn promote_due(&mut self, agent: &str, now: DateTime<Utc>) -> Vec<Task> {
        let QueueInner {
            tasks,
            ready,
            delayed,
            ..
        } = self;
        let Some(waiting) = delayed.get_mut(agent) else {
            return Vec::new();
        };

        let mut promoted = Vec::new();
        while let Some(&(due, id)) = waiting.first() {
            if due > now {
                break;
            }
            waiting.pop_first();
            let Some(task) = tasks.get_mut(&id) else {
                continue;
            };
            if task.status != TaskStatus::Retrying {
                continue;
            }
            task.status = TaskStatus::Pending;
            task.not_before = None;
            task.updated_at = now;
            ready
                .entry(agent.to_string())
                .or_default()
                .insert((Reverse(task.priority), task.sequence, id));
            promoted.push(task.clone());
        }
        promoted
    }
}

/// Priority queue of tasks with retry and status tracking.
///
/// Every transition is applied under one short synchronous lock, which is the
/// sole synchronization point between concurrent consumers, and then written
/// through to the state manager. Waiters learn about transitions through
/// [`changed`](Self::changed).
///
/// Task records stay in memory for the life of the process so finished tasks
/// remain queryable. Cancellation markers are dropped by
/// [`forget_run`](Self::forget_run) once their run is released.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    state: Arc<StateManager>,
    policy: RetryPolicy,
    changed: Notify,
}

impl TaskQueue {
    /// Create an empty queue persisting into `state`.
    pub fn new(state: Arc<StateManager>, policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            state,
            policy,
            changed: Notify::new(),
        }
    }

    /// Rebuild the queue from task records found in `state`.
    ///
    /// Tasks that were in progress when the previous process stopped go back
    /// to pending, so they run again (at-least-once).
    pub async fn restore(state: Arc<StateManager>, policy: RetryPolicy) -> Self {
        let queue = Self::new(Arc::clone(&state), policy);
        let mut pending_writes = Vec::new();
        let mut restored = 0usize;
        {
            let mut inner = queue.inner.lock();
            for scope in state.scopes() {
                let Scope::Task(id) = scope else {
                    continue;
                };
                let mut task: Task = match state.get_as(&scope, TASK_RECORD_KEY) {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Skipping unreadable task record");
                        continue;
                    }
                };
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Pending;
                    task.updated_at = Utc::now();
                    pending_writes.extend(queue.stage(&task));
                }
                match task.status {
                    TaskStatus::Pending => inner.push_ready(&task),
                    TaskStatus::Retrying => {
                        let due = task.not_before.unwrap_or_else(Utc::now);
                        inner
                            .delayed
                            .entry(task.target_agent.clone())
                            .or_default()
                            .insert((due, task.id));
                    }
                    _ => {}
                }
                inner.next_sequence = inner.next_sequence.max(task.sequence + 1);
                inner.tasks.insert(task.id, task);
                restored += 1;
            }
        }
        for pending in pending_writes {
            flush(pending).await;
        }
        if restored > 0 {
            info!(tasks = restored, "Task queue restored");
        }
        queue
    }

    /// Retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// A future that resolves on the next task transition. Call
    /// `enable()` on it before checking the condition you wait for.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    fn stage(&self, task: &Task) -> Option<PendingWrite> {
        match serde_json::to_value(task) {
            Ok(value) => Some(self.state.stage(Scope::Task(task.id), TASK_RECORD_KEY, value)),
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Task record not serializable");
                None
            }
        }
    }

    /// Create a pending task with default settings.
    pub async fn enqueue(
        &self,
        task_type: impl Into<String>,
        target_agent: impl Into<String>,
        payload: Value,
        priority: TaskPriority,
    ) -> Uuid {
        self.enqueue_task(TaskRequest::new(task_type, target_agent, payload).with_priority(priority))
            .await
    }

    /// Create a pending task from a full request.
    pub async fn enqueue_task(&self, request: TaskRequest) -> Uuid {
        let now = Utc::now();
        let (task, pending) = {
            let mut inner = self.inner.lock();
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;

            let cancelled = request
                .run_id
                .is_some_and(|r| inner.cancelled_runs.contains(&r));
            let task = Task {
                id: Uuid::new_v4(),
                task_type: request.task_type,
                target_agent: request.target_agent,
                payload: request.payload,
                context: request.context,
                priority: request.priority,
                status: if cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Pending
                },
                attempt_count: 0,
                max_attempts: request
                    .max_attempts
                    .unwrap_or(self.policy.default_max_attempts),
                run_id: request.run_id,
                correlation_id: request.correlation_id,
                timeout_ms: request.timeout_ms,
                last_error: None,
                output: None,
                created_at: now,
                updated_at: now,
                not_before: None,
                sequence,
            };
            if !cancelled {
                inner.push_ready(&task);
            }
            let pending = self.stage(&task);
            inner.tasks.insert(task.id, task.clone());
            (task, pending)
        };

        debug!(
            task_id = %task.id,
            agent = %task.target_agent,
            priority = %task.priority,
            status = %task.status,
            "Task enqueued"
        );
        if let Some(pending) = pending {
            flush(pending).await;
        }
        self.changed.notify_waiters();
        task.id
    }

    /// Take the highest-priority pending task for `agent`, marking it in
    /// progress. No two callers ever receive the same task.
    pub async fn dequeue(&self, agent: &str) -> MaestroResult<Option<Task>> {
        let now = Utc::now();
        let (taken, writes) = {
            let mut inner = self.inner.lock();
            let promoted = inner.promote_due(agent, now);
            let mut writes: Vec<PendingWrite> =
                promoted.iter().filter_map(|t| self.stage(t)).collect();

            let taken = match inner.ready.get_mut(agent).and_then(BTreeSet::pop_first) {
                None => Ok(None),
                Some((_, _, id)) => match inner.tasks.get_mut(&id) {
                    None => {
                        error!(task_id = %id, agent, "Ready entry without a task record");
                        Err(MaestroError::QueueContention(format!(
                            "ready entry {id} has no task record"
                        )))
                    }
                    Some(task) if task.status != TaskStatus::Pending => {
                        error!(task_id = %id, agent, status = %task.status, "Double dequeue detected");
                        Err(MaestroError::QueueContention(format!(
                            "task {id} was ready while {}",
                            task.status
                        )))
                    }
                    Some(task) => {
                        task.status = TaskStatus::InProgress;
                        task.updated_at = now;
                        let task = task.clone();
                        writes.extend(self.stage(&task));
                        Ok(Some(task))
                    }
                },
            };
            (taken, writes)
        };

        // Promotions stand even when the pop itself is refused.
        for pending in writes {
            flush(pending).await;
        }
        let task = taken?;
        if let Some(task) = &task {
            debug!(task_id = %task.id, agent, attempt = task.attempt_count, "Task dequeued");
        }
        Ok(task)
    }

    /// Record a successful outcome.
    ///
    /// Completing a task whose run was cancelled in the meantime leaves it
    /// cancelled and returns it unchanged.
    pub async fn complete(&self, id: Uuid, output: Value) -> MaestroResult<Task> {
        let (task, pending) = {
            let mut inner = self.inner.lock();
            let task = inner
                .tasks
                .get_mut(&id)
                .ok_or_else(|| MaestroError::NotFound(format!("task {id}")))?;
            match task.status {
                TaskStatus::InProgress => {}
                TaskStatus::Cancelled => return Ok(task.clone()),
                status => {
                    return Err(MaestroError::QueueContention(format!(
                        "cannot complete task {id} while {status}"
                    )))
                }
            }
            task.status = TaskStatus::Completed;
            task.output = Some(output);
            task.updated_at = Utc::now();
            let task = task.clone();
            let pending = self.stage(&task);
            (task, pending)
        };

        if let Some(pending) = pending {
            flush(pending).await;
        }
        self.changed.notify_waiters();
        Ok(task)
    }

    /// Record a failed attempt and decide whether to retry.
    ///
    /// A recoverable failure with retries left increments `attempt_count` and
    /// parks the task until its backoff elapses; anything else is terminal.
    pub async fn fail(&self, id: Uuid, error: HandlerError) -> MaestroResult<FailOutcome> {
        let now = Utc::now();
        let (outcome, task, pending) = {
            let mut guard = self.inner.lock();
            let QueueInner {
                tasks,
                delayed,
                cancelled_runs,
                ..
            } = &mut *guard;
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| MaestroError::NotFound(format!("task {id}")))?;
            match task.status {
                TaskStatus::InProgress => {}
                TaskStatus::Cancelled => return Ok(FailOutcome::Cancelled),
                status => {
                    return Err(MaestroError::QueueContention(format!(
                        "cannot fail task {id} while {status}"
                    )))
                }
            }

            let run_cancelled = task.run_id.is_some_and(|r| cancelled_runs.contains(&r));
            let outcome = if run_cancelled {
                task.status = TaskStatus::Cancelled;
                FailOutcome::Cancelled
            } else if self.policy.is_recoverable(&error) && task.attempt_count < task.max_attempts {
                task.attempt_count += 1;
                let delay = self.policy.backoff(task.attempt_count);
                let due = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                task.status = TaskStatus::Retrying;
                task.not_before = Some(due);
                delayed
                    .entry(task.target_agent.clone())
                    .or_default()
                    .insert((due, id));
                FailOutcome::Retrying {
                    attempt: task.attempt_count,
                    delay,
                }
            } else {
                task.status = TaskStatus::Failed;
                FailOutcome::Failed
            };
            task.last_error = Some(error);
            task.updated_at = now;
            let task = task.clone();
            let pending = self.stage(&task);
            (outcome, task, pending)
        };

        match outcome {
            FailOutcome::Retrying { attempt, delay } => info!(
                task_id = %id,
                agent = %task.target_agent,
                attempt,
                max_attempts = task.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Task scheduled for retry"
            ),
            FailOutcome::Failed => warn!(
                task_id = %id,
                agent = %task.target_agent,
                attempts = task.attempt_count,
                error = ?task.last_error,
                "Task failed"
            ),
            FailOutcome::Cancelled => debug!(task_id = %id, "Task ended by cancellation"),
        }
        if let Some(pending) = pending {
            flush(pending).await;
        }
        self.changed.notify_waiters();
        Ok(outcome)
    }

    /// Cancel every not-yet-running task of `run_id` and refuse further
    /// tasks for it. In-flight tasks are left to finish. Returns how many
    /// tasks were cancelled.
    pub async fn cancel_run(&self, run_id: Uuid) -> usize {
        let writes = {
            let mut guard = self.inner.lock();
            let QueueInner {
                tasks,
                ready,
                delayed,
                cancelled_runs,
                ..
            } = &mut *guard;
            cancelled_runs.insert(run_id);

            let now = Utc::now();
            let mut writes = Vec::new();
            for task in tasks.values_mut() {
                if task.run_id != Some(run_id)
                    || !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying)
                {
                    continue;
                }
                if let Some(queue) = ready.get_mut(&task.target_agent) {
                    queue.remove(&(Reverse(task.priority), task.sequence, task.id));
                }
                if let (Some(queue), Some(due)) =
                    (delayed.get_mut(&task.target_agent), task.not_before)
                {
                    queue.remove(&(due, task.id));
                }
                task.status = TaskStatus::Cancelled;
                task.updated_at = now;
                writes.extend(self.stage(task));
            }
            writes
        };

        let cancelled = writes.len();
        for pending in writes {
            flush(pending).await;
        }
        info!(run_id = %run_id, cancelled, "Run tasks cancelled");
        self.changed.notify_waiters();
        cancelled
    }

    /// Drop the cancellation marker of `run_id` once every one of its tasks
    /// is terminal. Called when the run is released; a marker whose run
    /// still has live tasks is kept.
    pub fn forget_run(&self, run_id: Uuid) {
        let mut inner = self.inner.lock();
        let settled = inner
            .tasks
            .values()
            .all(|t| t.run_id != Some(run_id) || t.is_terminal());
        if settled && inner.cancelled_runs.remove(&run_id) {
            debug!(run_id = %run_id, "Cancellation marker dropped");
        }
    }

    /// Whether `run_id` has been cancelled.
    pub fn is_run_cancelled(&self, run_id: Uuid) -> bool {
        self.inner.lock().cancelled_runs.contains(&run_id)
    }

    /// Point read of a task.
    pub fn status(&self, id: Uuid) -> MaestroResult<Task> {
        self.inner
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| MaestroError::NotFound(format!("task {id}")))
    }

    /// Pending tasks for `agent`, in dequeue order.
    pub fn pending_tasks(&self, agent: &str) -> Vec<Task> {
        let inner = self.inner.lock();
        inner
            .ready
            .get(agent)
            .map(|q| {
                q.iter()
                    .filter_map(|(_, _, id)| inner.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tasks currently in progress, oldest first.
    pub fn active_tasks(&self) -> Vec<Task> {
        let mut active: Vec<Task> = self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .cloned()
            .collect();
        active.sort_by_key(|t| t.sequence);
        active
    }

    /// Every task of `run_id`, in creation order.
    pub fn tasks_for_run(&self, run_id: Uuid) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.run_id == Some(run_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// When the next retrying task of `agent` becomes due.
    pub fn next_due(&self, agent: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .delayed
            .get(agent)
            .and_then(|q| q.first().map(|(due, _)| *due))
    }

    /// Number of tasks known to the queue, in any status.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn flush(pending: PendingWrite) {
    // The state manager reports the first failure and marks itself degraded;
    // the queue keeps working from memory.
    if let Err(e) = pending.commit().await {
        debug!(error = %e, "Task record flush failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> TaskQueue {
        TaskQueue::new(
            Arc::new(StateManager::in_memory()),
            RetryPolicy {
                backoff_base_ms: 0,
                backoff_max_ms: 0,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_empty_dequeue() {
        let q = queue();
        assert!(q.dequeue("scan").await.unwrap().is_none());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_priority_then_creation_order() {
        let q = queue();
        let low = q.enqueue("t", "a", json!(1), TaskPriority::Low).await;
        let normal1 = q.enqueue("t", "a", json!(2), TaskPriority::Normal).await;
        let critical = q.enqueue("t", "a", json!(3), TaskPriority::Critical).await;
        let normal2 = q.enqueue("t", "a", json!(4), TaskPriority::Normal).await;

        let order: Vec<Uuid> = {
            let mut out = Vec::new();
            while let Some(t) = q.dequeue("a").await.unwrap() {
                out.push(t.id);
            }
            out
        };
        assert_eq!(order, vec![critical, normal1, normal2, low]);
    }

    #[tokio::test]
    async fn test_agents_drain_independently() {
        let q = queue();
        q.enqueue("t", "a", json!(null), TaskPriority::Normal).await;
        let b = q.enqueue("t", "b", json!(null), TaskPriority::Low).await;
        let got = q.dequeue("b").await.unwrap().unwrap();
        assert_eq!(got.id, b);
        assert_eq!(got.status, TaskStatus::InProgress);
        assert!(q.dequeue("b").await.unwrap().is_none());
        assert_eq!(q.pending_tasks("a").len(), 1);
    }

    #[tokio::test]
    async fn test_complete() {
        let q = queue();
        let id = q.enqueue("t", "a", json!(null), TaskPriority::Normal).await;
        q.dequeue("a").await.unwrap();
        assert_eq!(q.active_tasks().len(), 1);
        let task = q.complete(id, json!("done")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output, Some(json!("done")));
        assert!(q.active_tasks().is_empty());

        // A second completion is an invariant violation.
        assert!(matches!(
            q.complete(id, json!("again")).await,
            Err(MaestroError::QueueContention(_))
        ));
    }

    #[tokio::test]
    async fn test_recoverable_failure_retries_until_budget() {
        let q = queue();
        let id = q
            .enqueue_task(TaskRequest::new("t", "a", json!(null)).with_max_attempts(2))
            .await;

        for expected in 1..=2u32 {
            q.dequeue("a").await.unwrap().unwrap();
            let outcome = q.fail(id, HandlerError::transient("flaky")).await.unwrap();
            assert!(matches!(outcome, FailOutcome::Retrying { attempt, .. } if attempt == expected));
            let task = q.status(id).unwrap();
            assert_eq!(task.attempt_count, expected);
            assert_eq!(task.status, TaskStatus::Retrying);
        }

        let task = q.dequeue("a").await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(q.fail(id, HandlerError::transient("flaky")).await.unwrap(), FailOutcome::Failed);
        let task = q.status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 2);
        assert!(q.dequeue("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_is_terminal() {
        let q = queue();
        let id = q.enqueue("t", "a", json!(null), TaskPriority::Normal).await;
        q.dequeue("a").await.unwrap();
        assert_eq!(q.fail(id, HandlerError::logic("bad")).await.unwrap(), FailOutcome::Failed);
        assert_eq!(q.status(id).unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn test_backoff_delays_redelivery() {
        let q = TaskQueue::new(
            Arc::new(StateManager::in_memory()),
            RetryPolicy {
                backoff_base_ms: 60_000,
                backoff_max_ms: 60_000,
                ..Default::default()
            },
        );
        let id = q.enqueue("t", "a", json!(null), TaskPriority::Normal).await;
        q.dequeue("a").await.unwrap();
        q.fail(id, HandlerError::timeout("slow")).await.unwrap();
        assert!(q.dequeue("a").await.unwrap().is_none());
        assert!(q.next_due("a").is_some());
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let q = queue();
        let run = Uuid::new_v4();
        let running = q
            .enqueue_task(TaskRequest::new("t", "a", json!(1)).with_run(run, "c"))
            .await;
        let waiting = q
            .enqueue_task(TaskRequest::new("t", "a", json!(2)).with_run(run, "c"))
            .await;
        let other = q.enqueue("t", "a", json!(3), TaskPriority::Low).await;
        assert_eq!(q.dequeue("a").await.unwrap().unwrap().id, running);

        assert_eq!(q.cancel_run(run).await, 1);
        assert_eq!(q.status(waiting).unwrap().status, TaskStatus::Cancelled);
        assert!(q.is_run_cancelled(run));

        // In-flight work is not retried once its run is cancelled.
        assert_eq!(
            q.fail(running, HandlerError::transient("x")).await.unwrap(),
            FailOutcome::Cancelled
        );
        // Late additions to the run are cancelled on arrival.
        let late = q
            .enqueue_task(TaskRequest::new("t", "a", json!(4)).with_run(run, "c"))
            .await;
        assert_eq!(q.status(late).unwrap().status, TaskStatus::Cancelled);

        assert_eq!(q.dequeue("a").await.unwrap().unwrap().id, other);
        assert_eq!(q.tasks_for_run(run).len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_marker_dropped_once_run_settles() {
        let q = queue();
        let run = Uuid::new_v4();
        let id = q
            .enqueue_task(TaskRequest::new("t", "a", json!(1)).with_run(run, "c"))
            .await;
        q.dequeue("a").await.unwrap();
        q.cancel_run(run).await;

        q.forget_run(run);
        assert!(q.is_run_cancelled(run), "in-flight task still needs the marker");

        assert_eq!(
            q.fail(id, HandlerError::transient("x")).await.unwrap(),
            FailOutcome::Cancelled
        );
        q.forget_run(run);
        assert!(!q.is_run_cancelled(run));
        assert_eq!(q.status(id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_refused_dequeue_keeps_promotions() {
        let state = Arc::new(StateManager::in_memory());
        let q = TaskQueue::new(
            Arc::clone(&state),
            RetryPolicy {
                backoff_base_ms: 0,
                backoff_max_ms: 0,
                ..Default::default()
            },
        );
        let id = q.enqueue("t", "a", json!(null), TaskPriority::Normal).await;
        q.dequeue("a").await.unwrap();
        q.fail(id, HandlerError::transient("flaky")).await.unwrap();

        let orphan = Uuid::new_v4();
        q.inner
            .lock()
            .ready
            .entry("a".to_string())
            .or_default()
            .insert((Reverse(TaskPriority::Critical), 0, orphan));

        assert!(matches!(q.dequeue("a").await, Err(MaestroError::QueueContention(_))));
        let stored: Task = state.get_as(&Scope::Task(id), TASK_RECORD_KEY).unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(q.dequeue("a").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_records_are_persisted_and_restored() {
        let state = Arc::new(StateManager::in_memory());
        let q = TaskQueue::new(Arc::clone(&state), RetryPolicy::default());
        let a = q.enqueue("t", "a", json!("first"), TaskPriority::Normal).await;
        let b = q.enqueue("t", "a", json!("second"), TaskPriority::Normal).await;
        q.dequeue("a").await.unwrap();

        let stored: Task = state.get_as(&Scope::Task(a), TASK_RECORD_KEY).unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);

        let restored = TaskQueue::restore(state, RetryPolicy::default()).await;
        assert_eq!(restored.status(a).unwrap().status, TaskStatus::Pending);
        assert_eq!(restored.dequeue("a").await.unwrap().unwrap().id, a);
        assert_eq!(restored.dequeue("a").await.unwrap().unwrap().id, b);
        let c = restored.enqueue("t", "a", json!(null), TaskPriority::Normal).await;
        assert!(restored.status(c).unwrap().sequence > restored.status(b).unwrap().sequence);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let q = queue();
        assert!(matches!(q.status(Uuid::new_v4()), Err(MaestroError::NotFound(_))));
        assert!(matches!(
            q.complete(Uuid::new_v4(), json!(null)).await,
            Err(MaestroError::NotFound(_))
        ));
    }
}
