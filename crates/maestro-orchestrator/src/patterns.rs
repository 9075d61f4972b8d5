use crate::executor::Executor;
use crate::handler::{CancellationSignal, HandlerError, HandlerErrorKind};
use crate::refinement::{CriticVerdict, Decision, Refinement};
use crate::types::{
    IterationRecord, LoopConfig, Pattern, RunStatus, StepOutcome, StepSpec, Task, TaskRequest,
    TaskStatus,
};
use futures_util::future::join_all;
use maestro_state::Scope;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State key of a run record.
pub fn run_key(run_id: Uuid) -> String {
    format!("run:{run_id}")
}

/// State key of one step's latest outcome within a run.
pub fn step_key(run_id: Uuid, step: &str) -> String {
    format!("run:{run_id}:step:{step}")
}

/// What the executor needs to know about the run it is working for.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub correlation_id: String,
    pub input: Value,
    pub cancellation: CancellationSignal,
}

/// Result of running one pattern to its end.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternOutcome {
    pub status: RunStatus,
    pub outputs: BTreeMap<String, StepOutcome>,
    pub result: Option<Value>,
    pub iterations: Vec<IterationRecord>,
}

impl Executor {
    /// Run `steps` under `pattern`. `loop_config` is required for loops and
    /// ignored otherwise.
    pub async fn run_pattern(
        &self,
        run: &RunHandle,
        pattern: Pattern,
        steps: &[StepSpec],
        loop_config: Option<&LoopConfig>,
    ) -> PatternOutcome {
        match (pattern, loop_config) {
            (Pattern::Sequential, _) => self.run_sequential(run, steps).await,
            (Pattern::Parallel, _) => self.run_parallel(run, steps).await,
            (Pattern::Loop, Some(config)) => self.run_loop(run, steps, config).await,
            (Pattern::Loop, None) => {
                error!(run_id = %run.run_id, "Loop run without loop config");
                PatternOutcome {
                    status: RunStatus::Failed,
                    outputs: BTreeMap::new(),
                    result: None,
                    iterations: Vec::new(),
                }
            }
        }
    }

    /// Enqueue the task for `step` without waiting for it.
    pub async fn submit_step(
        &self,
        run: &RunHandle,
        step: &StepSpec,
        context: Value,
    ) -> Uuid {
        let mut request = TaskRequest::new(step.name.clone(), step.target_agent.clone(), step.payload.clone())
            .with_context(context)
            .with_priority(step.priority)
            .with_run(run.run_id, run.correlation_id.clone())
            .with_timeout_ms(step.timeout_ms);
        if let Some(max_attempts) = step.max_attempts {
            request = request.with_max_attempts(max_attempts);
        }
        self.queue().enqueue_task(request).await
    }

    /// Wait for a submitted step, record its outcome in state, and return it.
    pub async fn await_step(&self, run: &RunHandle, step: &str, task_id: Uuid) -> StepOutcome {
        let outcome = match self.run_to_completion(task_id).await {
            Ok(task) => outcome_of(&task),
            Err(e) => {
                error!(run_id = %run.run_id, task_id = %task_id, step, error = %e, "Step could not be driven");
                StepOutcome::Error {
                    error: HandlerError::logic(format!("orchestrator fault: {e}"))
                        .with_recoverable(false),
                }
            }
        };
        self.record_step(run.run_id, step, &outcome).await;
        outcome
    }

    /// Submit `step` and wait for it.
    pub async fn run_step(
        &self,
        run: &RunHandle,
        step: &StepSpec,
        context: Value,
    ) -> StepOutcome {
        let task_id = self.submit_step(run, step, context).await;
        self.await_step(run, &step.name, task_id).await
    }

    async fn record_step(&self, run_id: Uuid, step: &str, outcome: &StepOutcome) {
        let value = match serde_json::to_value(outcome) {
            Ok(value) => value,
            Err(e) => {
                warn!(run_id = %run_id, step, error = %e, "Step outcome not serializable");
                return;
            }
        };
        if let Err(e) = self.state().set(Scope::Global, step_key(run_id, step), value).await {
            debug!(run_id = %run_id, step, error = %e, "Step outcome kept in memory only");
        }
    }

    /// Steps run one after another, each seeing the outputs of all earlier
    /// steps. The first failure stops the run.
    pub async fn run_sequential(
        &self,
        run: &RunHandle,
        steps: &[StepSpec],
    ) -> PatternOutcome {
        let mut context = Map::new();
        context.insert("input".to_string(), run.input.clone());
        let mut outputs = BTreeMap::new();
        let mut last_output = None;
        let mut status = RunStatus::Succeeded;

        for step in steps {
            if run.cancellation.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }
            let outcome = self
                .run_step(run, step, Value::Object(context.clone()))
                .await;
            let failed = match &outcome {
                StepOutcome::Success { output } => {
                    context.insert(step.name.clone(), output.clone());
                    last_output = Some(output.clone());
                    None
                }
                StepOutcome::Error { error } => Some(error.kind),
            };
            outputs.insert(step.name.clone(), outcome);

            if let Some(kind) = failed {
                info!(run_id = %run.run_id, step = %step.name, "Sequential run halted by failed step");
                status = failure_status(run, kind);
                break;
            }
        }

        PatternOutcome {
            status,
            outputs,
            result: last_output,
            iterations: Vec::new(),
        }
    }

    /// Every step is enqueued up front and runs independently; the run waits
    /// for all of them.
    pub async fn run_parallel(
        &self,
        run: &RunHandle,
        steps: &[StepSpec],
    ) -> PatternOutcome {
        let context = serde_json::json!({ "input": run.input });
        let mut submitted = Vec::with_capacity(steps.len());
        for step in steps {
            submitted.push((step, self.submit_step(run, step, context.clone()).await));
        }

        let results = join_all(
            submitted
                .iter()
                .map(|(step, task_id)| self.await_step(run, &step.name, *task_id)),
        )
        .await;

        let mut outputs = BTreeMap::new();
        let mut merged = Map::new();
        for ((step, _), outcome) in submitted.iter().zip(results) {
            if let StepOutcome::Success { output } = &outcome {
                merged.insert(step.name.clone(), output.clone());
            }
            outputs.insert(step.name.clone(), outcome);
        }

        let succeeded = merged.len();
        let status = if run.cancellation.is_cancelled() {
            RunStatus::Cancelled
        } else if succeeded == steps.len() {
            RunStatus::Succeeded
        } else if succeeded > 0 {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Failed
        };

        PatternOutcome {
            status,
            outputs,
            result: Some(Value::Object(merged)),
            iterations: Vec::new(),
        }
    }

    /// Alternate generator (`steps[0]`) and critic (`steps[1]`) until the
    /// critic's score meets the threshold or the iteration budget runs out.
    pub async fn run_loop(
        &self,
        run: &RunHandle,
        steps: &[StepSpec],
        config: &LoopConfig,
    ) -> PatternOutcome {
        let mut outputs = BTreeMap::new();
        let (Some(generator), Some(critic)) = (steps.first(), steps.get(1)) else {
            error!(run_id = %run.run_id, "Loop run needs a generator and a critic step");
            return PatternOutcome {
                status: RunStatus::Failed,
                outputs,
                result: None,
                iterations: Vec::new(),
            };
        };

        let mut refinement = Refinement::new(config, run.input.clone());
        let status = loop {
            if run.cancellation.is_cancelled() {
                break RunStatus::Cancelled;
            }
            let Some(generator_context) = refinement.begin_iteration() else {
                break RunStatus::Exhausted;
            };

            let generated = self.run_step(run, generator, generator_context).await;
            let draft = generated.output().cloned();
            let generator_error = generated.error().map(|e| e.kind);
            outputs.insert(generator.name.clone(), generated);
            let Some(draft) = draft else {
                break failure_status(run, generator_error.unwrap_or(HandlerErrorKind::Logic));
            };

            let critic_context = refinement.critic_context(&draft);
            let critique = self.run_step(run, critic, critic_context).await;
            let verdict = match &critique {
                StepOutcome::Success { output } => CriticVerdict::from_output(output),
                StepOutcome::Error { error } => Err(error.clone()),
            };
            let verdict = match verdict {
                Ok(verdict) => {
                    outputs.insert(critic.name.clone(), critique);
                    verdict
                }
                Err(error) => {
                    let kind = error.kind;
                    let outcome = StepOutcome::Error { error };
                    if critique.is_success() {
                        // The critic answered but its output was unusable.
                        self.record_step(run.run_id, &critic.name, &outcome).await;
                    }
                    outputs.insert(critic.name.clone(), outcome);
                    break failure_status(run, kind);
                }
            };

            info!(
                run_id = %run.run_id,
                iteration = refinement.iteration(),
                score = verdict.score,
                threshold = config.threshold,
                "Critic verdict"
            );
            match refinement.record(draft, verdict) {
                Decision::Accept => break RunStatus::Succeeded,
                Decision::Exhausted => break RunStatus::Exhausted,
                Decision::Continue => {}
            }
        };

        let result = match status {
            RunStatus::Succeeded => refinement.latest_output().cloned(),
            _ => refinement.best_output().cloned(),
        };
        if status == RunStatus::Exhausted {
            info!(
                run_id = %run.run_id,
                best_iteration = ?refinement.best_iteration(),
                "Loop budget exhausted"
            );
        }

        PatternOutcome {
            status,
            outputs,
            result,
            iterations: refinement.into_history(),
        }
    }
}

fn outcome_of(task: &Task) -> StepOutcome {
    match task.status {
        TaskStatus::Completed => StepOutcome::Success {
            output: task.output.clone().unwrap_or(Value::Null),
        },
        TaskStatus::Cancelled => StepOutcome::Error {
            error: HandlerError::cancelled("run cancelled before the task finished"),
        },
        _ => StepOutcome::Error {
            error: task
                .last_error
                .clone()
                .unwrap_or_else(|| HandlerError::logic(format!("task ended {}", task.status))),
        },
    }
}

fn failure_status(run: &RunHandle, kind: HandlerErrorKind) -> RunStatus {
    if kind == HandlerErrorKind::Cancelled || run.cancellation.is_cancelled() {
        RunStatus::Cancelled
    } else {
        RunStatus::Failed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::handler::{agent_fn, HandlerRegistry};
    use crate::monitor::AgentMonitor;
    use crate::retry::RetryPolicy;
    use crate::task_queue::TaskQueue;
    use maestro_core::MessageBus;
    use maestro_state::StateManager;
    use serde_json::json;
    use std::sync::Arc;

    fn executor(registry: HandlerRegistry) -> Executor {
        let state = Arc::new(StateManager::in_memory());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&state), RetryPolicy::default()));
        Executor::new(
            Arc::new(registry),
            queue,
            state,
            Arc::new(MessageBus::default()),
            Arc::new(AgentMonitor::new()),
            ExecutorConfig::default(),
        )
    }

    fn handle(exec: &Executor, input: Value) -> RunHandle {
        let run_id = Uuid::new_v4();
        RunHandle {
            run_id,
            correlation_id: run_id.to_string(),
            input,
            cancellation: exec.register_run(run_id),
        }
    }

    #[tokio::test]
    async fn test_sequential_accumulates_context() {
        let registry = HandlerRegistry::new()
            .with("upper", agent_fn(|_, ctx| async move {
                let text = ctx.context["input"].as_str().unwrap_or_default().to_uppercase();
                Ok(json!(text))
            }))
            .with("len", agent_fn(|_, ctx| async move {
                Ok(json!(ctx.context["shout"].as_str().map(str::len)))
            }));
        let exec = executor(registry);
        let run = handle(&exec, json!("abc"));
        let outcome = exec
            .run_sequential(
                &run,
                &[
                    StepSpec::new("shout", "upper", json!(null)),
                    StepSpec::new("measure", "len", json!(null)),
                ],
            )
            .await;
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.outputs["shout"].output(), Some(&json!("ABC")));
        assert_eq!(outcome.result, Some(json!(3)));

        let stored = exec
            .state()
            .get(&Scope::Global, &step_key(run.run_id, "measure"))
            .unwrap();
        assert_eq!(stored, json!({"status": "success", "output": 3}));
    }

    #[tokio::test]
    async fn test_parallel_partial_failure() {
        let registry = HandlerRegistry::new()
            .with("ok", agent_fn(|payload, _| async move { Ok(payload) }))
            .with("bad", agent_fn(|_, _| async move { Err(HandlerError::logic("nope")) }));
        let exec = executor(registry);
        let run = handle(&exec, json!(null));
        let outcome = exec
            .run_parallel(
                &run,
                &[
                    StepSpec::new("a", "ok", json!(1)),
                    StepSpec::new("b", "bad", json!(2)),
                    StepSpec::new("c", "ok", json!(3)),
                ],
            )
            .await;
        assert_eq!(outcome.status, RunStatus::PartiallyFailed);
        assert_eq!(outcome.outputs.len(), 3);
        assert!(!outcome.outputs["b"].is_success());
        assert_eq!(outcome.result, Some(json!({"a": 1, "c": 3})));
    }

    #[tokio::test]
    async fn test_loop_critic_without_score_fails_run() {
        let registry = HandlerRegistry::new()
            .with("writer", agent_fn(|_, _| async move { Ok(json!("draft")) }))
            .with("critic", agent_fn(|_, _| async move { Ok(json!({"verdict": "fine"})) }));
        let exec = executor(registry);
        let run = handle(&exec, json!("topic"));
        let outcome = exec
            .run_loop(
                &run,
                &[
                    StepSpec::new("write", "writer", json!(null)),
                    StepSpec::new("review", "critic", json!(null)),
                ],
                &LoopConfig {
                    threshold: 0.5,
                    max_iterations: 2,
                },
            )
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(
            outcome.outputs["review"].error().unwrap().kind,
            HandlerErrorKind::Logic
        );
    }

    #[test]
    fn test_keys() {
        let id = Uuid::nil();
        assert_eq!(run_key(id), format!("run:{id}"));
        assert_eq!(step_key(id, "scan"), format!("run:{id}:step:scan"));
    }
}
