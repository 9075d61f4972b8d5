//! Task queue, workflow patterns, and the coordinator for Maestro.
//!
//! A [`Coordinator`] accepts a [`WorkflowSpec`], records a [`WorkflowRun`]
//! in the state manager, and hands it to the [`Executor`], which decomposes
//! the run into tasks on the [`TaskQueue`] and dispatches each one to the
//! registered [`AgentHandler`] for its target agent. Progress is published
//! on the message bus and step outcomes are written back to state.
//!
//! # Main types
//!
//! - [`Coordinator`] — Submits runs, awaits and polls results, cancels runs.
//! - [`Executor`] — Runs the sequential, parallel, and loop patterns.
//! - [`TaskQueue`] — Per-agent priority queue with bounded retries.
//! - [`HandlerRegistry`] — Agent name to [`AgentHandler`] mapping.
//! - [`AgentMonitor`] — Per-agent working state and counters.
//! - [`MaestroConfig`] — TOML configuration for the whole process.

/// Process configuration.
pub mod config;
/// Workflow coordinator.
pub mod coordinator;
/// Task dispatch and the work-sharing executor loop.
pub mod executor;
/// Agent handler contract and registry.
pub mod handler;
/// Agent working state and metrics.
pub mod monitor;
/// Sequential, parallel, and loop patterns.
pub mod patterns;
/// Generator/critic loop state machine.
pub mod refinement;
/// Retry classification and backoff.
pub mod retry;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types (Task, WorkflowSpec, WorkflowRun, etc.).
pub mod types;

pub use config::MaestroConfig;
pub use coordinator::Coordinator;
pub use executor::{topics, Executor, ExecutorConfig};
pub use handler::{
    agent_fn, AgentHandler, CancellationSignal, HandlerError, HandlerErrorKind, HandlerRegistry,
    TaskContext,
};
pub use monitor::AgentMonitor;
pub use patterns::{PatternOutcome, RunHandle};
pub use refinement::{CriticVerdict, Decision, Refinement};
pub use retry::RetryPolicy;
pub use task_queue::{FailOutcome, TaskQueue};
pub use types::{
    AgentMetrics, AgentState, IterationRecord, LoopConfig, Pattern, RunStatus, StepOutcome,
    StepSpec, Task, TaskPriority, TaskRequest, TaskStatus, WorkerStatus, WorkflowResult,
    WorkflowRun, WorkflowSpec,
};
