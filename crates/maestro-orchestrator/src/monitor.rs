use crate::types::{AgentMetrics, AgentState, WorkerStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Tracks working state and counters for every agent the executor has
/// dispatched to.
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<String, AgentState>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Pre-create idle entries for `agents`.
    pub async fn register<'a>(&self, agents: impl IntoIterator<Item = &'a str>) {
        let mut states = self.states.write().await;
        for agent in agents {
            states
                .entry(agent.to_string())
                .or_insert_with(|| idle(agent));
        }
    }

    /// Mark an agent as working on a task.
    pub async fn start_task(&self, agent: &str, task_id: Uuid) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.to_string())
            .or_insert_with(|| idle(agent));
        state.in_flight.push(task_id);
        state.status = WorkerStatus::Working;
        state.metrics.dispatched += 1;
    }

    /// Record a successful task and its handler time.
    pub async fn finish_task(&self, agent: &str, task_id: Uuid, duration_ms: u64) {
        self.settle(agent, task_id, duration_ms, WorkerStatus::Idle, |m| m.completed += 1)
            .await;
    }

    /// Record an attempt that will be retried.
    pub async fn record_retry(&self, agent: &str, task_id: Uuid, duration_ms: u64) {
        self.settle(agent, task_id, duration_ms, WorkerStatus::Idle, |m| m.retried += 1)
            .await;
    }

    /// Record a terminal failure. The agent shows `Error` only once it has
    /// nothing else in flight.
    pub async fn record_error(&self, agent: &str, task_id: Uuid, duration_ms: u64) {
        self.settle(agent, task_id, duration_ms, WorkerStatus::Error, |m| m.failed += 1)
            .await;
    }

    async fn settle(
        &self,
        agent: &str,
        task_id: Uuid,
        duration_ms: u64,
        at_rest: WorkerStatus,
        bump: impl FnOnce(&mut AgentMetrics),
    ) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent.to_string())
            .or_insert_with(|| idle(agent));
        state.in_flight.retain(|id| *id != task_id);
        bump(&mut state.metrics);
        state.metrics.duration_ms += duration_ms;
        state.status = if state.in_flight.is_empty() {
            at_rest
        } else {
            WorkerStatus::Working
        };
    }

    /// Get a snapshot of all agent states, sorted by name.
    pub async fn snapshot(&self) -> Vec<AgentState> {
        let states = self.states.read().await;
        let mut all: Vec<AgentState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.agent.cmp(&b.agent));
        all
    }

    /// Get the state of a specific agent.
    pub async fn get_state(&self, agent: &str) -> Option<AgentState> {
        self.states.read().await.get(agent).cloned()
    }

    /// Get aggregate metrics across all agents.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.dispatched += state.metrics.dispatched;
            total.completed += state.metrics.completed;
            total.failed += state.metrics.failed;
            total.retried += state.metrics.retried;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": states,
            "aggregate": aggregate,
        })
    }
}

fn idle(agent: &str) -> AgentState {
    AgentState {
        agent: agent.to_string(),
        status: WorkerStatus::Idle,
        in_flight: Vec::new(),
        metrics: AgentMetrics::default(),
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
