use crate::registry::AgentStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use weave_channels::{ChannelMessage, MessageChannel, MessageKind};
use weave_core::{short_id, TaskId, WeaveResult};

/// Payload of every TASK message the orchestrator sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub task_id: TaskId,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Results of the task's completed prerequisites, keyed by task id.
    #[serde(default)]
    pub dependency_results: BTreeMap<TaskId, Value>,
    /// Zero on the first attempt, incremented on every retry.
    #[serde(default)]
    pub attempt: u32,
}

/// An agent that processes tasks on behalf of the orchestrator.
///
/// Implementations only see [`WorkRequest`]s. Mailbox handling, replies and
/// load accounting are done by the worker loop the orchestrator runs for each
/// registered worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique id. Also the name of the worker's mailbox.
    fn id(&self) -> &str;

    /// Broad kind of agent (e.g. `"researcher"`). Task requirements match
    /// either this or one of the capabilities.
    fn worker_type(&self) -> &str;

    /// Capability tags this worker serves.
    fn capabilities(&self) -> Vec<String>;

    /// Self-reported status. Returning [`AgentStatus::Offline`] takes the
    /// worker out of rotation on the next scheduling pass.
    fn status(&self) -> AgentStatus {
        AgentStatus::Idle
    }

    /// Do the work. An `Err` becomes an ERROR reply and counts as a failed
    /// attempt.
    async fn process(&self, request: WorkRequest) -> WeaveResult<Value>;
}

/// Run `worker` against its mailbox until the mailbox is closed or removed.
///
/// Each TASK message is processed in its own tokio task so a slow request
/// does not hold up the rest of the mailbox. A panic inside
/// [`Worker::process`] is caught at that task boundary and reported back as an
/// ERROR reply.
pub fn spawn_worker_loop(worker: Arc<dyn Worker>, channel: Arc<MessageChannel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let worker_id = worker.id().to_string();
        debug!(agent = %worker_id, "Worker loop started");

        while let Some(message) = channel.recv(&worker_id).await {
            if message.kind != MessageKind::Task {
                debug!(agent = %worker_id, kind = %message.kind, "Ignoring non-task message");
                continue;
            }
            let worker = Arc::clone(&worker);
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                let reply = handle_task(worker, &message).await;
                if !channel.deliver(reply) {
                    debug!(message_id = %short_id(&message.id), "Reply dropped, requester stopped waiting");
                }
            });
        }

        debug!(agent = %worker_id, "Worker loop stopped");
    })
}

async fn handle_task(worker: Arc<dyn Worker>, message: &ChannelMessage) -> ChannelMessage {
    let worker_id = worker.id().to_string();
    let request: WorkRequest = match serde_json::from_value(message.payload.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!(agent = %worker_id, error = %e, "Malformed work request");
            return message.reply(
                &worker_id,
                MessageKind::Error,
                json!({ "error": format!("Malformed work request: {e}") }),
            );
        }
    };
    let task_id = request.task_id;

    let outcome = tokio::spawn(async move { worker.process(request).await }).await;
    match outcome {
        Ok(Ok(value)) => message.reply(&worker_id, MessageKind::Result, value),
        Ok(Err(e)) => message.reply(
            &worker_id,
            MessageKind::Error,
            json!({ "error": e.to_string() }),
        ),
        Err(e) => {
            warn!(agent = %worker_id, task_id = %short_id(&task_id), error = %e, "Worker aborted while processing");
            message.reply(
                &worker_id,
                MessageKind::Error,
                json!({ "error": format!("Worker {worker_id} aborted: {e}") }),
            )
        }
    }
}
