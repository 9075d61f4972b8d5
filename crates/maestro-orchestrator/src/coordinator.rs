use crate::config::MaestroConfig;
use crate::executor::{topics, Executor};
use crate::handler::HandlerRegistry;
use crate::monitor::AgentMonitor;
use crate::patterns::{run_key, step_key, RunHandle};
use crate::task_queue::TaskQueue;
use crate::types::{Pattern, RunStatus, StepOutcome, WorkflowResult, WorkflowRun, WorkflowSpec};
use chrono::Utc;
use maestro_core::{MaestroError, MaestroResult, MessageBus, MessageKind};
use maestro_state::{open_backend, Scope, StateManager};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

const SENDER_ID: &str = "coordinator";

struct RunSlot {
    run: WorkflowRun,
    done: watch::Receiver<Option<WorkflowResult>>,
}

/// Entry point for workflow runs.
///
/// Validates submissions, owns every [`WorkflowRun`] record, and drives each
/// run on its own tokio task through the [`Executor`]. Cheap to clone; clones
/// share the same runs.
///
/// Runs submitted to this process stay in memory until it exits; earlier
/// runs are read back from the state manager.
#[derive(Clone)]
pub struct Coordinator {
    executor: Arc<Executor>,
    runs: Arc<RwLock<HashMap<Uuid, RunSlot>>>,
}

impl Coordinator {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Wire every component from `config` and recover state left by a
    /// previous process.
    pub async fn from_config(config: &MaestroConfig, registry: HandlerRegistry) -> MaestroResult<Self> {
        config.validate()?;
        let backend = open_backend(&config.state, &config.data_dir).await?;
        let state = Arc::new(StateManager::open(backend).await);
        let queue = Arc::new(TaskQueue::restore(Arc::clone(&state), config.queue.clone()).await);
        let bus = Arc::new(MessageBus::new(config.bus.clone()));
        let monitor = Arc::new(AgentMonitor::new());
        monitor.register(registry.names()).await;

        let executor = Arc::new(Executor::new(
            Arc::new(registry),
            queue,
            state,
            bus,
            monitor,
            config.executor.clone(),
        ));
        let coordinator = Self::new(executor);
        let interrupted = coordinator.recover_interrupted().await;
        info!(
            backend = coordinator.executor.state().backend_name(),
            agents = coordinator.executor.registry().len(),
            interrupted,
            "Coordinator ready"
        );
        Ok(coordinator)
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        self.executor.bus()
    }

    pub fn state(&self) -> &Arc<StateManager> {
        self.executor.state()
    }

    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        self.executor.monitor()
    }

    /// Validate `spec`, record a new run, and start it in the background.
    pub async fn submit(&self, spec: WorkflowSpec) -> MaestroResult<Uuid> {
        if let Err(e) = self.validate(&spec) {
            warn!(pattern = %spec.pattern, error = %e, "Workflow rejected");
            return Err(e);
        }

        let run = WorkflowRun::new(&spec);
        let run_id = run.run_id;
        let (tx, done) = watch::channel(None);
        self.persist(&run).await;
        self.runs.write().insert(run_id, RunSlot { run, done });
        let cancellation = self.executor.register_run(run_id);

        info!(run_id = %run_id, pattern = %spec.pattern, steps = spec.steps.len(), "Workflow submitted");
        let this = self.clone();
        tokio::spawn(async move {
            let handle = RunHandle {
                run_id,
                correlation_id: run_id.to_string(),
                input: spec.input,
                cancellation,
            };
            this.drive(handle, tx).await;
        });
        Ok(run_id)
    }

    /// Submit `spec` and wait up to `timeout` for its result.
    pub async fn run(&self, spec: WorkflowSpec, timeout: Duration) -> MaestroResult<WorkflowResult> {
        let run_id = self.submit(spec).await?;
        self.await_result(run_id, timeout).await
    }

    fn validate(&self, spec: &WorkflowSpec) -> MaestroResult<()> {
        if spec.steps.is_empty() {
            return Err(MaestroError::Validation("workflow has no steps".into()));
        }
        let mut names = HashSet::new();
        for step in &spec.steps {
            if step.name.is_empty() {
                return Err(MaestroError::Validation("step name must not be empty".into()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(MaestroError::Validation(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if !self.executor.registry().contains(&step.target_agent) {
                return Err(MaestroError::Validation(format!(
                    "step '{}' targets unregistered agent '{}'",
                    step.name, step.target_agent
                )));
            }
        }

        if spec.pattern == Pattern::Loop {
            let config = spec.loop_config.ok_or_else(|| {
                MaestroError::Validation("loop workflow needs loop_config".into())
            })?;
            if !config.threshold.is_finite() {
                return Err(MaestroError::Validation(
                    "loop threshold must be a finite number".into(),
                ));
            }
            if config.max_iterations == 0 {
                return Err(MaestroError::Validation(
                    "loop max_iterations must be at least 1".into(),
                ));
            }
            if spec.steps.len() != 2 {
                return Err(MaestroError::Validation(format!(
                    "loop workflow needs exactly a generator and a critic step, got {}",
                    spec.steps.len()
                )));
            }
        }
        Ok(())
    }

    async fn drive(&self, handle: RunHandle, tx: watch::Sender<Option<WorkflowResult>>) {
        let run_id = handle.run_id;
        let started = {
            let mut runs = self.runs.write();
            runs.get_mut(&run_id).map(|slot| {
                if slot.run.status == RunStatus::Created {
                    slot.run.status = RunStatus::Running;
                }
                slot.run.started_at = Some(Utc::now());
                slot.run.clone()
            })
        };
        let Some(started) = started else {
            error!(run_id = %run_id, "Run vanished before it started");
            return;
        };

        self.persist(&started).await;
        self.executor.bus().publish(
            topics::RUN_STARTED,
            SENDER_ID,
            MessageKind::Event,
            json!({"run_id": run_id, "pattern": started.pattern, "steps": started.steps.len()}),
            handle.correlation_id.as_str(),
        );

        let outcome = self
            .executor
            .run_pattern(
                &handle,
                started.pattern,
                &started.steps,
                started.loop_config.as_ref(),
            )
            .await;

        let finished = {
            let mut runs = self.runs.write();
            runs.get_mut(&run_id).map(|slot| {
                let run = &mut slot.run;
                run.status = if run.status == RunStatus::Cancelled
                    || handle.cancellation.is_cancelled()
                {
                    RunStatus::Cancelled
                } else {
                    outcome.status
                };
                run.outputs = outcome.outputs;
                run.aggregated_result = outcome.result;
                run.iterations = outcome.iterations;
                run.finished_at = Some(Utc::now());
                run.clone()
            })
        };
        self.executor.release_run(run_id);
        let Some(finished) = finished else {
            error!(run_id = %run_id, "Run vanished before it finished");
            return;
        };

        self.persist(&finished).await;
        let result = finished.result();
        info!(
            run_id = %run_id,
            status = %finished.status,
            duration_ms = result.as_ref().map(|r| r.duration_ms),
            "Workflow finished"
        );
        self.executor.bus().publish(
            topics::RUN_FINISHED,
            SENDER_ID,
            MessageKind::Result,
            serde_json::to_value(&result).unwrap_or_else(|_| json!({"run_id": run_id})),
            handle.correlation_id.as_str(),
        );
        tx.send_replace(result);
    }

    /// Wait until `run_id` finishes, at most `timeout`.
    ///
    /// On timeout the run keeps going and can be awaited again.
    pub async fn await_result(&self, run_id: Uuid, timeout: Duration) -> MaestroResult<WorkflowResult> {
        let receiver = self.runs.read().get(&run_id).map(|slot| slot.done.clone());
        let Some(mut done) = receiver else {
            return self
                .stored_run(run_id)?
                .result()
                .ok_or_else(|| MaestroError::NotFound(format!("no result for run {run_id}")));
        };

        let outcome = match tokio::time::timeout(timeout, done.wait_for(Option::is_some)).await {
            Ok(Ok(result)) => (*result)
                .clone()
                .ok_or_else(|| MaestroError::NotFound(format!("no result for run {run_id}"))),
            Ok(Err(_)) => self
                .runs
                .read()
                .get(&run_id)
                .and_then(|slot| slot.run.result())
                .ok_or_else(|| MaestroError::Handler(format!("run {run_id} stopped without a result"))),
            Err(_) => Err(MaestroError::Timeout(format!(
                "run {run_id} still running after {} ms",
                timeout.as_millis()
            ))),
        };
        outcome
    }

    /// Snapshot of a run. While the run is in flight, outcomes of steps that
    /// already finished are included.
    pub fn get_status(&self, run_id: Uuid) -> MaestroResult<WorkflowRun> {
        let live = self.runs.read().get(&run_id).map(|slot| slot.run.clone());
        match live {
            Some(mut run) => {
                if run.finished_at.is_none() {
                    run.outputs = self.stored_step_outcomes(&run);
                }
                Ok(run)
            }
            None => self.stored_run(run_id),
        }
    }

    /// Cancel a run. Queued tasks are dropped and in-flight handlers see the
    /// signal. Returns `false` if the run had already finished.
    pub async fn cancel(&self, run_id: Uuid) -> MaestroResult<bool> {
        let cancelled = {
            let mut runs = self.runs.write();
            let Some(slot) = runs.get_mut(&run_id) else {
                return Err(MaestroError::NotFound(format!("run {run_id}")));
            };
            if slot.run.finished_at.is_some() {
                false
            } else {
                slot.run.status = RunStatus::Cancelled;
                true
            }
        };
        if cancelled {
            info!(run_id = %run_id, "Cancelling workflow");
            self.executor.cancel_run(run_id).await;
        }
        Ok(cancelled)
    }

    /// Every run known to this process, oldest first.
    pub fn list_runs(&self) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self.runs.read().values().map(|s| s.run.clone()).collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Mark runs a previous process left unfinished as failed and cancel
    /// their leftover tasks. Returns how many runs were affected.
    pub async fn recover_interrupted(&self) -> usize {
        let state = self.executor.state();
        let mut interrupted = Vec::new();
        for (key, value) in state.list(&Scope::Global) {
            if !key.starts_with("run:") || key.contains(":step:") {
                continue;
            }
            match serde_json::from_value::<WorkflowRun>(value) {
                Ok(run) if run.finished_at.is_none() => interrupted.push(run),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable run record"),
            }
        }

        let count = interrupted.len();
        for mut run in interrupted {
            warn!(run_id = %run.run_id, status = %run.status, "Run interrupted by restart");
            self.executor.queue().cancel_run(run.run_id).await;
            self.executor.queue().forget_run(run.run_id);
            run.outputs = self.stored_step_outcomes(&run);
            if run.status != RunStatus::Cancelled {
                run.status = RunStatus::Failed;
            }
            run.finished_at = Some(Utc::now());
            self.persist(&run).await;
        }
        count
    }

    fn stored_run(&self, run_id: Uuid) -> MaestroResult<WorkflowRun> {
        let mut run: WorkflowRun = match self.state().get_as(&Scope::Global, &run_key(run_id)) {
            Ok(run) => run,
            Err(MaestroError::NotFound(_)) => {
                return Err(MaestroError::NotFound(format!("run {run_id}")));
            }
            Err(e) => return Err(e),
        };
        if run.outputs.is_empty() {
            run.outputs = self.stored_step_outcomes(&run);
        }
        Ok(run)
    }

    fn stored_step_outcomes(&self, run: &WorkflowRun) -> BTreeMap<String, StepOutcome> {
        run.steps
            .iter()
            .filter_map(|step| {
                self.state()
                    .get_as::<StepOutcome>(&Scope::Global, &step_key(run.run_id, &step.name))
                    .ok()
                    .map(|outcome| (step.name.clone(), outcome))
            })
            .collect()
    }

    async fn persist(&self, run: &WorkflowRun) {
        if let Err(e) = self
            .state()
            .set_as(Scope::Global, run_key(run.run_id), run)
            .await
        {
            warn!(run_id = %run.run_id, error = %e, "Run record kept in memory only");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::handler::agent_fn;
    use crate::retry::RetryPolicy;
    use crate::types::{LoopConfig, StepSpec};
    use serde_json::Value;

    fn coordinator(registry: HandlerRegistry) -> Coordinator {
        let state = Arc::new(StateManager::in_memory());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&state), RetryPolicy::default()));
        Coordinator::new(Arc::new(Executor::new(
            Arc::new(registry),
            queue,
            state,
            Arc::new(MessageBus::default()),
            Arc::new(AgentMonitor::new()),
            ExecutorConfig::default(),
        )))
    }

    fn echo_registry() -> HandlerRegistry {
        HandlerRegistry::new().with("echo", agent_fn(|payload, _| async move { Ok(payload) }))
    }

    #[tokio::test]
    async fn test_rejects_invalid_specs() {
        let coord = coordinator(echo_registry());

        let empty = coord.submit(WorkflowSpec::sequential(vec![])).await;
        assert!(matches!(empty, Err(MaestroError::Validation(_))));

        let dup = coord
            .submit(WorkflowSpec::parallel(vec![
                StepSpec::new("a", "echo", Value::Null),
                StepSpec::new("a", "echo", Value::Null),
            ]))
            .await;
        assert!(matches!(dup, Err(MaestroError::Validation(_))));

        let unknown = coord
            .submit(WorkflowSpec::sequential(vec![StepSpec::new("a", "ghost", Value::Null)]))
            .await;
        assert!(matches!(unknown, Err(MaestroError::Validation(_))));

        let mut no_config = WorkflowSpec::refinement(
            StepSpec::new("gen", "echo", Value::Null),
            StepSpec::new("crit", "echo", Value::Null),
            LoopConfig {
                threshold: 0.5,
                max_iterations: 1,
            },
        );
        no_config.loop_config = None;
        assert!(matches!(coord.submit(no_config).await, Err(MaestroError::Validation(_))));

        let zero_budget = WorkflowSpec::refinement(
            StepSpec::new("gen", "echo", Value::Null),
            StepSpec::new("crit", "echo", Value::Null),
            LoopConfig {
                threshold: 0.5,
                max_iterations: 0,
            },
        );
        assert!(matches!(coord.submit(zero_budget).await, Err(MaestroError::Validation(_))));

        assert!(coord.list_runs().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_result_and_persists_record() {
        let coord = coordinator(echo_registry());
        let result = coord
            .run(
                WorkflowSpec::sequential(vec![StepSpec::new("only", "echo", json!({"x": 1}))]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.result, Some(json!({"x": 1})));

        let stored: WorkflowRun = coord
            .state()
            .get_as(&Scope::Global, &run_key(result.run_id))
            .unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.finished_at.is_some());
        assert_eq!(coord.get_status(result.run_id).unwrap().status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let coord = coordinator(echo_registry());
        let id = Uuid::new_v4();
        assert!(matches!(coord.get_status(id), Err(MaestroError::NotFound(_))));
        assert!(matches!(
            coord.await_result(id, Duration::from_millis(10)).await,
            Err(MaestroError::NotFound(_))
        ));
        assert!(matches!(coord.cancel(id).await, Err(MaestroError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_finished_run_is_noop() {
        let coord = coordinator(echo_registry());
        let result = coord
            .run(
                WorkflowSpec::parallel(vec![StepSpec::new("a", "echo", json!(1))]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(!coord.cancel(result.run_id).await.unwrap());
        assert_eq!(coord.get_status(result.run_id).unwrap().status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_marked_before_signal_is_kept() {
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let (s, r) = (Arc::clone(&started), Arc::clone(&release));
        let registry = HandlerRegistry::new().with(
            "gated",
            agent_fn(move |payload, _| {
                let (started, release) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(payload)
                }
            }),
        );
        let coord = coordinator(registry);
        let run_id = coord
            .submit(WorkflowSpec::sequential(vec![StepSpec::new("a", "gated", json!(1))]))
            .await
            .unwrap();
        started.notified().await;

        // Status is flipped first; the handler finishes before the signal lands.
        coord.runs.write().get_mut(&run_id).unwrap().run.status = RunStatus::Cancelled;
        release.notify_one();

        let result = coord.await_result(run_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(coord.get_status(run_id).unwrap().status, RunStatus::Cancelled);
        assert!(!coord.cancel(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_interrupted_marks_failed() {
        let coord = coordinator(echo_registry());
        let mut run = WorkflowRun::new(&WorkflowSpec::sequential(vec![StepSpec::new(
            "a",
            "echo",
            Value::Null,
        )]));
        run.status = RunStatus::Running;
        coord
            .state()
            .set_as(Scope::Global, run_key(run.run_id), &run)
            .await
            .unwrap();
        coord
            .state()
            .set_as(
                Scope::Global,
                step_key(run.run_id, "a"),
                &StepOutcome::Success { output: json!(7) },
            )
            .await
            .unwrap();

        assert_eq!(coord.recover_interrupted().await, 1);
        let status = coord.get_status(run.run_id).unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert_eq!(status.outputs["a"].output(), Some(&json!(7)));
        let result = coord
            .await_result(run.run_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);

        assert_eq!(coord.recover_interrupted().await, 0);
    }
}
