//! Built-in worker used by task files.

use async_trait::async_trait;
use serde_json::{json, Value};
use weave_core::WeaveResult;
use weave_orchestrator::{WorkRequest, Worker};

/// Echoes its input back along with the results it was handed from
/// upstream tasks, so a task file's data flow can be inspected end to end.
pub struct EchoWorker {
    id: String,
    agent_type: String,
    capabilities: Vec<String>,
}

impl EchoWorker {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities,
        }
    }
}

#[async_trait]
impl Worker for EchoWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn worker_type(&self) -> &str {
        &self.agent_type
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn process(&self, request: WorkRequest) -> WeaveResult<Value> {
        let upstream: serde_json::Map<String, Value> = request
            .dependency_results
            .into_iter()
            .map(|(id, value)| (id.to_string(), value))
            .collect();
        Ok(json!({
            "agent": self.id,
            "action": request.action,
            "echo": request.input,
            "upstream": upstream,
        }))
    }
}
