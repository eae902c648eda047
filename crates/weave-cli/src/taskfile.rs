//! TOML task files: the agents to start and the tasks to submit.
//!
//! ```toml
//! [[agents]]
//! id = "writer-1"
//! type = "writer"
//! capabilities = ["draft"]
//!
//! [[tasks]]
//! name = "outline"
//! capability = "draft"
//! input = { topic = "rust" }
//!
//! [[tasks]]
//! name = "chapter"
//! capability = "writer"
//! priority = "high"
//! depends_on = ["outline"]
//! ```

use crate::echo::EchoWorker;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use weave_core::{TaskId, WeaveError, WeaveResult};
use weave_orchestrator::{ExecutionSummary, Orchestrator, Priority, TaskRequest};

/// Metadata key carrying a task's name from the file.
pub const TASK_NAME_KEY: &str = "name";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub capability: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_action() -> String {
    "run".to_string()
}

/// Two-way mapping between task names and the ids they were submitted under.
#[derive(Debug, Clone, Default)]
pub struct TaskNames {
    ids: BTreeMap<String, TaskId>,
    names: HashMap<TaskId, String>,
}

impl TaskNames {
    fn insert(&mut self, name: &str, id: TaskId) {
        self.ids.insert(name.to_string(), id);
        self.names.insert(id, name.to_string());
    }

    pub fn id(&self, name: &str) -> Option<TaskId> {
        self.ids.get(name).copied()
    }

    /// The task's name, or its id when it did not come from the file.
    pub fn name(&self, id: TaskId) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    pub fn names(&self, ids: &[TaskId]) -> Vec<String> {
        ids.iter().map(|id| self.name(*id)).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl TaskFile {
    pub fn parse(content: &str) -> WeaveResult<Self> {
        toml::from_str(content)
            .map_err(|e| WeaveError::Config(format!("Failed to parse task file: {e}")))
    }

    pub fn load(path: &Path) -> WeaveResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WeaveError::Config(format!(
                "Failed to read task file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Start an [`EchoWorker`] for every declared agent.
    pub fn register_agents(&self, orchestrator: &Orchestrator) -> WeaveResult<()> {
        for spec in &self.agents {
            orchestrator.register_agent(Arc::new(EchoWorker::new(
                spec.id.clone(),
                spec.agent_type.clone(),
                spec.capabilities.clone(),
            )))?;
        }
        Ok(())
    }

    /// Submit every task, resolving `depends_on` names. Tasks may be listed
    /// in any order; a name that is unknown or part of a cycle is rejected
    /// before anything is submitted.
    pub fn submit(&self, orchestrator: &Orchestrator) -> WeaveResult<TaskNames> {
        let order = self.submission_order()?;
        let mut names = TaskNames::default();

        for spec in order {
            let mut request = TaskRequest::new(&spec.capability, &spec.action)
                .with_input(spec.input.clone())
                .with_priority(spec.priority)
                .with_metadata(TASK_NAME_KEY, Value::String(spec.name.clone()));
            for (key, value) in &spec.metadata {
                request = request.with_metadata(key.clone(), value.clone());
            }
            for dep in &spec.depends_on {
                if let Some(id) = names.id(dep) {
                    request = request.depends_on(id);
                }
            }
            if let Some(retries) = spec.max_retries {
                request = request.with_max_retries(retries);
            }
            request.timeout_ms = spec.timeout_ms;

            let id = orchestrator.add_task(request)?;
            names.insert(&spec.name, id);
        }

        info!(tasks = names.len(), agents = self.agents.len(), "Task file loaded");
        Ok(names)
    }

    /// Tasks ordered so every task comes after the tasks it names.
    fn submission_order(&self) -> WeaveResult<Vec<&TaskSpec>> {
        let mut declared = HashSet::new();
        for spec in &self.tasks {
            if !declared.insert(spec.name.as_str()) {
                return Err(WeaveError::Validation(format!(
                    "Duplicate task name '{}'",
                    spec.name
                )));
            }
        }
        for spec in &self.tasks {
            if let Some(unknown) = spec.depends_on.iter().find(|d| !declared.contains(d.as_str())) {
                return Err(WeaveError::Validation(format!(
                    "Task '{}' depends on unknown task '{unknown}'",
                    spec.name
                )));
            }
        }

        let mut placed: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(self.tasks.len());
        while order.len() < self.tasks.len() {
            let before = order.len();
            for spec in &self.tasks {
                if !placed.contains(spec.name.as_str())
                    && spec.depends_on.iter().all(|d| placed.contains(d.as_str()))
                {
                    placed.insert(spec.name.as_str());
                    order.push(spec);
                }
            }
            if order.len() == before {
                let mut stuck: Vec<&str> = self
                    .tasks
                    .iter()
                    .map(|t| t.name.as_str())
                    .filter(|n| !placed.contains(n))
                    .collect();
                stuck.sort_unstable();
                return Err(WeaveError::CircularDependency(stuck.join(", ")));
            }
        }
        Ok(order)
    }
}

/// JSON report of a run, with tasks referred to by name.
pub fn run_report(
    summary: &ExecutionSummary,
    names: &TaskNames,
    orchestrator: &Orchestrator,
) -> Value {
    let results: BTreeMap<String, Value> = summary
        .completed
        .iter()
        .filter_map(|id| orchestrator.task_result(*id).map(|v| (names.name(*id), v)))
        .collect();
    let errors: BTreeMap<String, Value> = summary
        .failed
        .iter()
        .filter_map(|id| {
            orchestrator
                .task(*id)
                .and_then(|t| t.error)
                .map(|e| (names.name(*id), Value::String(e)))
        })
        .collect();

    serde_json::json!({
        "completed": names.names(&summary.completed),
        "failed": names.names(&summary.failed),
        "cancelled": names.names(&summary.cancelled),
        "pending": names.names(&summary.pending),
        "iterations": summary.iterations,
        "stalled": summary.stalled,
        "results": results,
        "errors": errors,
    })
}

/// Execution layers with task names.
pub fn plan_report(orchestrator: &Orchestrator, names: &TaskNames) -> WeaveResult<Value> {
    let layers: Vec<Vec<String>> = orchestrator
        .execution_plan()?
        .iter()
        .map(|layer| {
            let mut layer = names.names(layer);
            layer.sort();
            layer
        })
        .collect();
    Ok(serde_json::json!({ "layers": layers }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use weave_orchestrator::OrchestratorConfig;

    const PIPELINE: &str = r#"
[[agents]]
id = "writer-1"
type = "writer"
capabilities = ["draft", "edit"]

[[tasks]]
name = "publish"
capability = "writer"
priority = "low"
depends_on = ["left", "right"]

[[tasks]]
name = "outline"
capability = "draft"
input = { topic = "rust" }
priority = "high"

[[tasks]]
name = "left"
capability = "edit"
depends_on = ["outline"]
max_retries = 1

[[tasks]]
name = "right"
capability = "edit"
depends_on = ["outline"]
timeout_ms = 2000
"#;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default().with_poll_interval(Duration::from_millis(5)))
    }

    #[test]
    fn test_parse_defaults() {
        let file = TaskFile::parse(PIPELINE).unwrap();
        assert_eq!(file.agents.len(), 1);
        assert_eq!(file.agents[0].agent_type, "writer");
        let outline = file.tasks.iter().find(|t| t.name == "outline").unwrap();
        assert_eq!(outline.action, "run");
        assert_eq!(outline.priority, Priority::High);
        assert_eq!(outline.input, json!({ "topic": "rust" }));
    }

    #[test]
    fn test_plan_resolves_names_in_any_order() {
        let file = TaskFile::parse(PIPELINE).unwrap();
        let orch = orchestrator();
        let names = file.submit(&orch).unwrap();
        assert_eq!(names.len(), 4);

        let plan = plan_report(&orch, &names).unwrap();
        assert_eq!(
            plan,
            json!({ "layers": [["outline"], ["left", "right"], ["publish"]] })
        );

        let right = orch.task(names.id("right").unwrap()).unwrap();
        assert_eq!(right.timeout_ms, Some(2000));
        assert_eq!(right.metadata[TASK_NAME_KEY], json!("right"));
    }

    #[test]
    fn test_unknown_and_duplicate_names_rejected() {
        let orch = orchestrator();
        let unknown = TaskFile::parse(
            r#"
[[tasks]]
name = "a"
capability = "x"
depends_on = ["nope"]
"#,
        )
        .unwrap();
        assert!(matches!(unknown.submit(&orch), Err(WeaveError::Validation(_))));

        let duplicate = TaskFile::parse(
            r#"
[[tasks]]
name = "a"
capability = "x"

[[tasks]]
name = "a"
capability = "y"
"#,
        )
        .unwrap();
        assert!(matches!(duplicate.submit(&orch), Err(WeaveError::Validation(_))));
        assert!(orch.tasks().is_empty());
    }

    #[test]
    fn test_cycle_rejected_before_submission() {
        let orch = orchestrator();
        let file = TaskFile::parse(
            r#"
[[tasks]]
name = "a"
capability = "x"
depends_on = ["b"]

[[tasks]]
name = "b"
capability = "x"
depends_on = ["a"]

[[tasks]]
name = "c"
capability = "x"
"#,
        )
        .unwrap();
        match file.submit(&orch) {
            Err(WeaveError::CircularDependency(names)) => assert_eq!(names, "a, b"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(orch.tasks().is_empty());
    }

    #[test]
    fn test_invalid_toml() {
        let err = TaskFile::parse("[[tasks]\nname = 1").unwrap_err();
        assert!(matches!(err, WeaveError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_pipeline_with_echo_workers() {
        let file = TaskFile::parse(PIPELINE).unwrap();
        let orch = orchestrator();
        file.register_agents(&orch).unwrap();
        let names = file.submit(&orch).unwrap();

        let summary = orch.execute_all(100).await;
        assert!(summary.is_success());

        let report = run_report(&summary, &names, &orch);
        assert_eq!(report["completed"].as_array().unwrap().len(), 4);
        assert_eq!(report["stalled"], json!(false));
        assert_eq!(report["results"]["outline"]["echo"]["topic"], json!("rust"));
        let publish_upstream = report["results"]["publish"]["upstream"].as_object().unwrap();
        assert_eq!(publish_upstream.len(), 2);
    }
}
