//! Task orchestration engine: dependency graph, priority queue, agent
//! registry, result aggregation and the scheduling loop that ties them to
//! workers over the message channel.
//!
//! A caller registers [`Worker`]s, submits [`TaskRequest`]s with their
//! prerequisites, and runs [`Orchestrator::execute_all`]. Each pass promotes
//! tasks whose prerequisites completed, hands the highest-priority ready tasks
//! to the least-loaded capable agent, and records results in the shared state
//! store.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Owns every subsystem and runs the scheduling loop.
//! - [`DependencyGraph`]: Acyclic prerequisite graph with layered planning.
//! - [`TaskQueue`]: Priority queue plus the lifecycle of every task.
//! - [`AgentRegistry`]: Capability lookup and load-balanced assignment.
//! - [`ResultAggregator`]: Combines candidate results from several agents.
//! - [`Worker`]: Contract implemented by task-processing agents.

/// Aggregation strategies over candidate results.
pub mod aggregator;
/// Orchestrator tunables.
pub mod config;
/// Scheduling loop and system status.
pub mod engine;
/// Prerequisite graph and planning algorithms.
pub mod graph;
/// Agent descriptors and load-balanced selection.
pub mod registry;
/// Priority task queue and task lifecycle.
pub mod task_queue;
/// Task, priority and status types.
pub mod types;
/// Worker contract and worker loop.
pub mod worker;

pub use aggregator::{
    AggregationStrategy, AgreementAnalysis, Candidate, NumericMethod, ResultAggregator, ValueCount,
};
pub use config::OrchestratorConfig;
pub use engine::{ExecutionSummary, Orchestrator, SystemStatus, TASK_EVENTS_TOPIC};
pub use graph::{DependencyGraph, GraphStatistics};
pub use registry::{
    AgentDescriptor, AgentRegistry, AgentStatus, RegistryStatistics, DEFAULT_MAX_LOAD,
};
pub use task_queue::{QueueStatistics, TaskQueue};
pub use types::{Priority, Task, TaskRequest, TaskStatus, MAX_RETRIES_KEY, TIMEOUT_MS_KEY};
pub use worker::{spawn_worker_loop, WorkRequest, Worker};
