use crate::handler::HandlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Scheduling priority. Ordered `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Waiting out its backoff before becoming pending again.
    Retrying,
    /// Its run was cancelled before it finished.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed, or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A unit of work bound to one target agent.
///
/// Identity is stable across retries: a retry mutates this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub target_agent: String,
    pub payload: Value,
    /// Accumulated workflow context handed to the handler.
    #[serde(default)]
    pub context: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Retries performed so far.
    pub attempt_count: u32,
    /// Retries allowed before the task fails for good.
    pub max_attempts: u32,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Execution deadline; the executor default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub last_error: Option<HandlerError>,
    #[serde(default)]
    pub output: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a retrying task may be dequeued again.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Creation order, used to break priority ties.
    pub sequence: u64,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Everything needed to enqueue a task.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_type: String,
    pub target_agent: String,
    pub payload: Value,
    pub context: Value,
    pub priority: TaskPriority,
    pub max_attempts: Option<u32>,
    pub run_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, target_agent: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            target_agent: target_agent.into(),
            payload,
            context: Value::Null,
            priority: TaskPriority::Normal,
            max_attempts: None,
            run_id: None,
            correlation_id: None,
            timeout_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Attach the task to a run.
    pub fn with_run(mut self, run_id: Uuid, correlation_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id);
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Execution strategy of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Sequential,
    Parallel,
    Loop,
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Sequential => write!(f, "sequential"),
            Pattern::Parallel => write!(f, "parallel"),
            Pattern::Loop => write!(f, "loop"),
        }
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the workflow; keys the result map.
    pub name: String,
    pub target_agent: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Overrides the queue's default retry budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides the executor's default deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, target_agent: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            target_agent: target_agent.into(),
            payload,
            priority: TaskPriority::Normal,
            max_attempts: None,
            timeout_ms: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Convergence settings of a loop workflow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Critic score at or above which the loop accepts.
    pub threshold: f64,
    /// Generator dispatch budget.
    pub max_iterations: u32,
}

/// A workflow submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub pattern: Pattern,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub loop_config: Option<LoopConfig>,
    /// Initial input, visible to every step as `context.input`.
    #[serde(default)]
    pub input: Value,
}

impl WorkflowSpec {
    pub fn sequential(steps: Vec<StepSpec>) -> Self {
        Self {
            pattern: Pattern::Sequential,
            steps,
            loop_config: None,
            input: Value::Null,
        }
    }

    pub fn parallel(steps: Vec<StepSpec>) -> Self {
        Self {
            pattern: Pattern::Parallel,
            steps,
            loop_config: None,
            input: Value::Null,
        }
    }

    /// A generator/critic loop.
    pub fn refinement(generator: StepSpec, critic: StepSpec, config: LoopConfig) -> Self {
        Self {
            pattern: Pattern::Loop,
            steps: vec![generator, critic],
            loop_config: Some(config),
            input: Value::Null,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
    /// Loop budget spent without reaching the threshold.
    Exhausted,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Created | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Failed => "failed",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Terminal outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome {
    Success { output: Value },
    Error { error: HandlerError },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            StepOutcome::Success { output } => Some(output),
            StepOutcome::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&HandlerError> {
        match self {
            StepOutcome::Success { .. } => None,
            StepOutcome::Error { error } => Some(error),
        }
    }
}

/// One generator/critic round of a loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based.
    pub iteration: u32,
    pub output: Value,
    pub score: f64,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Aggregated result of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Outcome per step name. Always one entry per dispatched step.
    pub outputs: BTreeMap<String, StepOutcome>,
    /// Pattern-specific final value: the last sequential output, the map of
    /// successful parallel outputs, or the accepted/best loop output.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    pub duration_ms: u64,
}

/// The coordinator's record of a run, persisted under `run:<uuid>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub correlation_id: String,
    pub pattern: Pattern,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub loop_config: Option<LoopConfig>,
    #[serde(default)]
    pub input: Value,
    pub status: RunStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, StepOutcome>,
    #[serde(default)]
    pub aggregated_result: Option<Value>,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(spec: &WorkflowSpec) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            correlation_id: run_id.to_string(),
            pattern: spec.pattern,
            steps: spec.steps.clone(),
            loop_config: spec.loop_config,
            input: spec.input.clone(),
            status: RunStatus::Created,
            outputs: BTreeMap::new(),
            aggregated_result: None,
            iterations: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// The result, once the run has finished.
    pub fn result(&self) -> Option<WorkflowResult> {
        let finished_at = self.finished_at?;
        let started = self.started_at.unwrap_or(self.created_at);
        Some(WorkflowResult {
            run_id: self.run_id,
            status: self.status,
            outputs: self.outputs.clone(),
            result: self.aggregated_result.clone(),
            iterations: self.iterations.clone(),
            duration_ms: u64::try_from((finished_at - started).num_milliseconds()).unwrap_or(0),
        })
    }
}

/// Working state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
    Error,
}

/// Counters kept per agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub duration_ms: u64,
}

/// Snapshot of one agent for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent: String,
    pub status: WorkerStatus,
    /// Tasks currently being handled.
    pub in_flight: Vec<Uuid>,
    pub metrics: AgentMetrics,
}
