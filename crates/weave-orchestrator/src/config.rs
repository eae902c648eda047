use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrent tasks an agent accepts before it stops being selected.
    #[serde(default = "default_max_load_per_agent")]
    pub max_load_per_agent: usize,
    /// Per-attempt timeout for tasks that do not set their own.
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,
    /// Retry budget for tasks that do not set their own.
    #[serde(default)]
    pub default_max_retries: u32,
    /// How long one scheduling pass waits for a ready task.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on tasks dispatched in one scheduling pass.
    #[serde(default = "default_max_parallel_dispatch")]
    pub max_parallel_dispatch: usize,
    /// Cancel the dependents of failed or cancelled tasks instead of leaving
    /// them pending.
    #[serde(default = "default_cascade_cancel")]
    pub cascade_cancel: bool,
    /// Messages kept in the channel history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_load_per_agent() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_max_parallel_dispatch() -> usize {
    8
}

fn default_cascade_cancel() -> bool {
    true
}

fn default_history_limit() -> usize {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_load_per_agent: default_max_load_per_agent(),
            default_task_timeout_ms: default_task_timeout_ms(),
            default_max_retries: 0,
            poll_interval_ms: default_poll_interval_ms(),
            max_parallel_dispatch: default_max_parallel_dispatch(),
            cascade_cancel: default_cascade_cancel(),
            history_limit: default_history_limit(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_cascade_cancel(mut self, cascade: bool) -> Self {
        self.cascade_cancel = cascade;
        self
    }

    pub fn with_max_load(mut self, max_load: usize) -> Self {
        self.max_load_per_agent = max_load;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
