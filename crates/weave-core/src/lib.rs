//! Core types and error definitions for the Weave orchestration engine.
//!
//! This crate provides the foundational types shared across all Weave crates:
//! the unified error enum and the identifier aliases used by the task graph,
//! the queue, and the agent registry.
//!
//! # Main types
//!
//! - [`WeaveError`]: Unified error enum for all Weave subsystems.
//! - [`WeaveResult`]: Convenience alias for `Result<T, WeaveError>`.
//! - [`TaskId`]: Stable identifier of a submitted task.
//! - [`AgentId`]: Identifier of a registered worker.

/// Error taxonomy.
pub mod error;

pub use error::{WeaveError, WeaveResult};

use uuid::Uuid;

/// Stable identifier of a task. Assigned at submission and never reused.
pub type TaskId = Uuid;

/// Identifier of a registered agent (worker).
pub type AgentId = String;

/// Sender id used by the orchestrator on every message it emits.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Abbreviated id for log lines (first 8 hex characters).
pub fn short_id(id: &Uuid) -> String {
    let mut s = id.simple().to_string();
    s.truncate(8);
    s
}
