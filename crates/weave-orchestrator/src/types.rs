use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;
use weave_core::{AgentId, TaskId};

/// Metadata key that overrides the per-task timeout (milliseconds).
pub const TIMEOUT_MS_KEY: &str = "timeout_ms";
/// Metadata key that overrides the per-task retry budget.
pub const MAX_RETRIES_KEY: &str = "max_retries";

/// Scheduling priority. Lower numeric value is served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle state of a task.
///
/// `Pending -> Ready -> Assigned -> InProgress -> {Completed | Failed}`, with
/// `Pending | Ready -> Cancelled`. A task goes back to `Ready` from `Assigned`
/// when no agent can take it, and from `InProgress` when it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never change again.
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
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Everything a caller supplies when submitting a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Agent type or capability tag required to run the task.
    pub capability: String,
    pub action: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskRequest {
    pub fn new(capability: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        for id in deps {
            self = self.depends_on(id);
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// A task tracked by the queue and the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub capability: String,
    pub action: String,
    pub input: serde_json::Value,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Retry budget. `None` falls back to the orchestrator default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Per-attempt timeout. `None` falls back to the orchestrator default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Submission order, used to break ties within a priority band.
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    /// Build a pending task from a request. Builder overrides win over the
    /// `timeout_ms` / `max_retries` metadata keys.
    pub fn from_request(request: TaskRequest) -> Self {
        let max_retries = request.max_retries.or_else(|| {
            request
                .metadata
                .get(MAX_RETRIES_KEY)
                .and_then(serde_json::Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
        });
        let timeout_ms = request.timeout_ms.or_else(|| {
            request
                .metadata
                .get(TIMEOUT_MS_KEY)
                .and_then(serde_json::Value::as_u64)
        });

        Self {
            id: Uuid::new_v4(),
            capability: request.capability,
            action: request.action,
            input: request.input,
            priority: request.priority,
            dependencies: request.dependencies,
            status: TaskStatus::Pending,
            metadata: request.metadata,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            timeout_ms,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            sequence: 0,
        }
    }

    pub fn effective_timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }

    pub fn effective_max_retries(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    /// Whether another attempt fits in the retry budget.
    pub fn can_retry(&self, default_max_retries: u32) -> bool {
        self.retry_count < self.effective_max_retries(default_max_retries)
    }

    /// Wall time between start and completion, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
        assert_eq!(Priority::Critical as u8, 0);
    }

    #[test]
    fn test_priority_serialization() {
        let p: Priority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, Priority::High);
        assert_eq!(Priority::Low.to_string(), "low");
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_request_builder_dedups_dependencies() {
        let dep = Uuid::new_v4();
        let req = TaskRequest::new("research", "search")
            .depends_on(dep)
            .with_dependencies([dep]);
        assert_eq!(req.dependencies, vec![dep]);
    }

    #[test]
    fn test_metadata_overrides() {
        let task = Task::from_request(
            TaskRequest::new("writer", "draft")
                .with_metadata(TIMEOUT_MS_KEY, json!(250))
                .with_metadata(MAX_RETRIES_KEY, json!(2)),
        );
        assert_eq!(task.effective_timeout(60_000), Duration::from_millis(250));
        assert_eq!(task.effective_max_retries(0), 2);
        assert!(task.can_retry(0));
    }

    #[test]
    fn test_builder_beats_metadata() {
        let task = Task::from_request(
            TaskRequest::new("writer", "draft")
                .with_metadata(MAX_RETRIES_KEY, json!(5))
                .with_max_retries(1)
                .with_timeout(Duration::from_secs(2)),
        );
        assert_eq!(task.max_retries, Some(1));
        assert_eq!(task.timeout_ms, Some(2000));
    }

    #[test]
    fn test_defaults_apply() {
        let task = Task::from_request(TaskRequest::new("writer", "draft"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.effective_timeout(1000), Duration::from_secs(1));
        assert!(!task.can_retry(0));
        assert!(task.duration().is_none());
    }

    #[test]
    fn test_task_serialization() {
        let task = Task::from_request(TaskRequest::new("analysis", "score").with_input(json!([1, 2])));
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.input, json!([1, 2]));
    }
}
