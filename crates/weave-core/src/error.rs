use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`WeaveError`].
pub type WeaveResult<T> = Result<T, WeaveError>;

/// Top-level error type for the Weave engine.
///
/// Structural variants (`Validation`, `CircularDependency`) are returned by the
/// call that caused them. Runtime variants (`TaskExecution`, `TaskTimeout`) are
/// recorded on the task they belong to and never abort the scheduling loop.
#[derive(Error, Debug)]
pub enum WeaveError {
    /// A malformed submission: unknown dependency id, missing capability,
    /// or an illegal state transition.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Adding an edge would close a cycle. The graph is left unchanged.
    #[error("Circular dependency: {0}")]
    CircularDependency(String),

    /// No registered, online agent below its load threshold can take the task.
    #[error("No available agent for '{0}'")]
    NoAvailableAgent(String),

    /// The worker reported an error while processing the task.
    #[error("Task {task_id} failed: {reason}")]
    TaskExecution {
        /// The task that failed.
        task_id: Uuid,
        /// Worker-supplied failure reason.
        reason: String,
    },

    /// The worker did not reply within the task timeout.
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// The task that timed out.
        task_id: Uuid,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// An aggregation strategy could not combine the candidates.
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// The scheduling loop exhausted its iteration budget with unfinished tasks.
    #[error("Scheduling stalled with {} unfinished task(s)", task_ids.len())]
    SchedulingStalled {
        /// Tasks still pending or ready when the loop stopped.
        task_ids: Vec<Uuid>,
    },

    /// An error from the message channel.
    #[error("Channel error: {0}")]
    Channel(String),

    /// An error from the shared state store.
    #[error("State error: {0}")]
    State(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WeaveError {
    /// Whether this error is a per-task runtime failure that consumes a retry.
    pub fn is_task_failure(&self) -> bool {
        matches!(
            self,
            WeaveError::TaskExecution { .. } | WeaveError::TaskTimeout { .. }
        )
    }
}
