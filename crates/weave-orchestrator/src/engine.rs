use crate::aggregator::{AggregationStrategy, Candidate, ResultAggregator};
use crate::config::OrchestratorConfig;
use crate::graph::{DependencyGraph, GraphStatistics};
use crate::registry::{AgentDescriptor, AgentRegistry, AgentStatus, RegistryStatistics};
use crate::task_queue::{QueueStatistics, TaskQueue};
use crate::types::{Task, TaskRequest, TaskStatus};
use crate::worker::{spawn_worker_loop, WorkRequest, Worker};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use weave_channels::{ChannelMessage, ChannelStatistics, MessageChannel, MessageKind};
use weave_core::{short_id, AgentId, TaskId, WeaveError, WeaveResult, ORCHESTRATOR_ID};
use weave_memory::{SharedStateStore, StateStatistics};

/// Topic on which task completion and failure notifications are broadcast.
pub const TASK_EVENTS_TOPIC: &str = "task-events";

/// Outcome of one [`Orchestrator::execute_all`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub cancelled: Vec<TaskId>,
    /// Tasks that were still unfinished when the loop stopped.
    pub pending: Vec<TaskId>,
    pub iterations: usize,
    /// The iteration cap was hit with unfinished tasks left.
    pub stalled: bool,
}

impl ExecutionSummary {
    /// Every task reached COMPLETED.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty() && self.pending.is_empty()
    }

    /// Turn a stalled run into [`WeaveError::SchedulingStalled`].
    pub fn into_result(self) -> WeaveResult<Self> {
        if self.stalled {
            Err(WeaveError::SchedulingStalled {
                task_ids: self.pending,
            })
        } else {
            Ok(self)
        }
    }
}

/// Snapshot of every subsystem, for status endpoints and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub timestamp: DateTime<Utc>,
    pub running: bool,
    pub queue: QueueStatistics,
    pub registry: RegistryStatistics,
    pub graph: GraphStatistics,
    pub channel: ChannelStatistics,
    pub state: StateStatistics,
}

struct WorkerHandle {
    worker: Arc<dyn Worker>,
    handle: JoinHandle<()>,
}

/// Components shared between the scheduling loop and its dispatch tasks.
#[derive(Clone)]
struct Core {
    config: Arc<OrchestratorConfig>,
    queue: Arc<TaskQueue>,
    graph: Arc<Mutex<DependencyGraph>>,
    registry: Arc<AgentRegistry>,
    channel: Arc<MessageChannel>,
    state: Arc<SharedStateStore>,
}

impl Core {
    /// One attempt of one task on `agent_id`. Never returns an error: every
    /// outcome is recorded on the task and the agent's load is released.
    async fn dispatch(self, task: Task, agent_id: AgentId) {
        let task_id = task.id;
        let attempt = task.retry_count;

        if let Err(e) = self.queue.mark_in_progress(task_id, &agent_id) {
            warn!(task_id = %short_id(&task_id), error = %e, "Dispatch skipped");
            if let Err(e) = self.registry.decrement_load(&agent_id) {
                debug!(agent = %agent_id, error = %e, "Load release failed");
            }
            return;
        }
        self.state.write(
            &format!("task:{task_id}"),
            json!({ "status": TaskStatus::InProgress, "agent": agent_id, "attempt": attempt }),
            ORCHESTRATOR_ID,
        );
        info!(
            task_id = %short_id(&task_id),
            agent = %agent_id,
            capability = %task.capability,
            attempt,
            "Dispatching task"
        );

        let outcome = self.run_attempt(&task, &agent_id).await;
        self.finish(&task, &agent_id, outcome);
    }

    async fn run_attempt(&self, task: &Task, agent_id: &str) -> WeaveResult<Value> {
        let dependency_results: BTreeMap<TaskId, Value> = task
            .dependencies
            .iter()
            .filter_map(|dep| self.queue.result(*dep).map(|value| (*dep, value)))
            .collect();
        let request = WorkRequest {
            task_id: task.id,
            action: task.action.clone(),
            input: task.input.clone(),
            metadata: task.metadata.clone(),
            dependency_results,
            attempt: task.retry_count,
        };
        let payload = serde_json::to_value(&request)?;

        let reply_box = format!("{ORCHESTRATOR_ID}/{}/{}", task.id, task.retry_count);
        let timeout = task.effective_timeout(self.config.default_task_timeout_ms);
        self.channel.open_mailbox(&reply_box);

        let message = ChannelMessage::new(ORCHESTRATOR_ID, agent_id, MessageKind::Task, payload)
            .with_reply_to(&reply_box)
            .with_metadata("task_id", json!(task.id))
            .with_metadata("attempt", json!(task.retry_count));

        let outcome = match self.channel.send(message) {
            // The agent went away after selection; another one may take the retry.
            Err(e) => Err(WeaveError::TaskExecution {
                task_id: task.id,
                reason: format!("Agent {agent_id} unreachable: {e}"),
            }),
            Ok(()) => match self.channel.receive(&reply_box, timeout).await {
                Some(reply) if reply.kind == MessageKind::Result => Ok(reply.payload),
                Some(reply) => Err(WeaveError::TaskExecution {
                    task_id: task.id,
                    reason: reply
                        .payload
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("worker reported an error")
                        .to_string(),
                }),
                None => Err(WeaveError::TaskTimeout {
                    task_id: task.id,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
        };
        // Any reply arriving after this point is dropped.
        self.channel.remove_mailbox(&reply_box);
        outcome
    }

    fn finish(&self, task: &Task, agent_id: &str, outcome: WeaveResult<Value>) {
        let task_id = task.id;
        match outcome {
            Ok(value) => {
                self.state
                    .write(&format!("result:{task_id}"), value.clone(), agent_id);
                if let Err(e) = self.queue.complete_task(task_id, value) {
                    warn!(task_id = %short_id(&task_id), error = %e, "Could not record completion");
                }
                self.graph.lock().mark_completed(task_id);
                self.release(agent_id, true);
                self.record_status(task_id, TaskStatus::Completed, None);
                info!(task_id = %short_id(&task_id), agent = %agent_id, "Task completed");
            }
            Err(e) => {
                self.release(agent_id, false);
                let budget = task.effective_max_retries(self.config.default_max_retries);
                if e.is_task_failure() && task.retry_count < budget {
                    match self.queue.retry(task_id, e.to_string()) {
                        Ok(count) => warn!(
                            task_id = %short_id(&task_id),
                            agent = %agent_id,
                            retry = count,
                            max_retries = budget,
                            error = %e,
                            "Task attempt failed, retrying"
                        ),
                        Err(err) => {
                            warn!(task_id = %short_id(&task_id), error = %err, "Could not requeue task")
                        }
                    }
                    return;
                }
                if let Err(err) = self.queue.fail_task(task_id, e.to_string()) {
                    warn!(task_id = %short_id(&task_id), error = %err, "Could not record failure");
                }
                self.record_status(task_id, TaskStatus::Failed, Some(e.to_string()));
                error!(task_id = %short_id(&task_id), agent = %agent_id, error = %e, "Task failed");
            }
        }
    }

    fn release(&self, agent_id: &str, success: bool) {
        if let Err(e) = self.registry.release(agent_id, success) {
            debug!(agent = %agent_id, error = %e, "Load release failed");
        }
    }

    fn record_status(&self, task_id: TaskId, status: TaskStatus, error: Option<String>) {
        self.state.write(
            &format!("task:{task_id}"),
            json!({ "status": status, "error": error }),
            ORCHESTRATOR_ID,
        );
        let event = ChannelMessage::new(
            ORCHESTRATOR_ID,
            TASK_EVENTS_TOPIC,
            MessageKind::Notification,
            json!({ "task_id": task_id, "status": status, "error": error }),
        );
        self.channel.broadcast(TASK_EVENTS_TOPIC, event);
    }
}

/// Schedules submitted tasks across registered workers.
///
/// Owns one instance of every subsystem. Workers are driven through their
/// mailboxes on the shared [`MessageChannel`]; results land in the
/// [`SharedStateStore`] under `result:<task id>`.
pub struct Orchestrator {
    core: Core,
    aggregator: ResultAggregator,
    workers: Mutex<HashMap<AgentId, WorkerHandle>>,
    running: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator with an in-memory shared state store.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_shared_state(config, Arc::new(SharedStateStore::new()))
    }

    /// Create an orchestrator around an existing (possibly persistent) store.
    pub fn with_shared_state(config: OrchestratorConfig, state: Arc<SharedStateStore>) -> Self {
        let core = Core {
            queue: Arc::new(TaskQueue::new()),
            graph: Arc::new(Mutex::new(DependencyGraph::new())),
            registry: Arc::new(AgentRegistry::with_max_load(config.max_load_per_agent)),
            channel: Arc::new(MessageChannel::with_history_limit(config.history_limit)),
            state,
            config: Arc::new(config),
        };
        Self {
            core,
            aggregator: ResultAggregator::default(),
            workers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.core.config
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.core.channel
    }

    pub fn shared_state(&self) -> &Arc<SharedStateStore> {
        &self.core.state
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.core.registry
    }

    /// Whether `execute_all` is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- Agents ----

    /// Register a worker: registry entry, mailbox and worker loop. A worker
    /// registered again under the same id replaces the previous instance.
    pub fn register_agent(&self, worker: Arc<dyn Worker>) -> WeaveResult<AgentDescriptor> {
        let id = worker.id().to_string();
        if id.trim().is_empty() {
            return Err(WeaveError::Validation("Agent id must not be empty".into()));
        }
        if id == ORCHESTRATOR_ID || id.starts_with(&format!("{ORCHESTRATOR_ID}/")) {
            return Err(WeaveError::Validation(format!(
                "Agent id '{id}' is reserved"
            )));
        }

        if let Some(previous) = self.workers.lock().remove(&id) {
            self.core.channel.remove_mailbox(&id);
            previous.handle.abort();
        }

        let descriptor =
            self.core
                .registry
                .register(id.clone(), worker.worker_type(), worker.capabilities());
        self.core.channel.open_mailbox(&id);
        let handle = spawn_worker_loop(Arc::clone(&worker), Arc::clone(&self.core.channel));
        self.workers
            .lock()
            .insert(id, WorkerHandle { worker, handle });
        Ok(descriptor)
    }

    /// Take a worker out of rotation and close its mailbox. In-flight
    /// attempts still deliver their replies.
    pub fn unregister_agent(&self, id: &str) -> WeaveResult<()> {
        self.core.registry.unregister(id)?;
        self.workers.lock().remove(id);
        self.core.channel.remove_mailbox(id);
        Ok(())
    }

    /// Mirror each worker's self-reported availability into the registry.
    fn sync_worker_status(&self) {
        let workers: Vec<Arc<dyn Worker>> = self
            .workers
            .lock()
            .values()
            .map(|h| Arc::clone(&h.worker))
            .collect();
        for worker in workers {
            let Some(current) = self.core.registry.get(worker.id()).map(|a| a.status) else {
                continue;
            };
            let reported = worker.status();
            let offline_now = reported == AgentStatus::Offline;
            if offline_now != (current == AgentStatus::Offline) {
                if let Err(e) = self.core.registry.set_status(worker.id(), reported) {
                    debug!(agent = %worker.id(), error = %e, "Status sync failed");
                } else {
                    info!(agent = %worker.id(), status = %reported, "Agent availability changed");
                }
            }
        }
    }

    // ---- Tasks ----

    /// Submit a task. Its dependencies must already be submitted.
    pub fn add_task(&self, request: TaskRequest) -> WeaveResult<TaskId> {
        if request.capability.trim().is_empty() {
            return Err(WeaveError::Validation(
                "Task capability must not be empty".into(),
            ));
        }
        let task = Task::from_request(request);
        let id = task.id;

        let mut graph = self.core.graph.lock();
        if let Some(unknown) = task.dependencies.iter().find(|d| !graph.contains(**d)) {
            return Err(WeaveError::Validation(format!(
                "Unknown dependency {unknown}"
            )));
        }
        graph.add_node(id);
        for dep in &task.dependencies {
            if let Err(e) = graph.add_dependency(id, *dep) {
                graph.remove_node(id);
                return Err(e);
            }
        }
        if let Err(e) = self.core.queue.insert(task) {
            graph.remove_node(id);
            return Err(e);
        }
        drop(graph);

        debug!(task_id = %short_id(&id), "Task submitted");
        Ok(id)
    }

    /// Add a prerequisite to a task that has not been dispatched yet.
    pub fn add_dependency(&self, id: TaskId, depends_on: TaskId) -> WeaveResult<()> {
        match self.core.queue.status(id) {
            Some(TaskStatus::Pending | TaskStatus::Ready) => {}
            Some(status) => {
                return Err(WeaveError::Validation(format!(
                    "Task {} is already {status}",
                    short_id(&id)
                )))
            }
            None => return Err(WeaveError::Validation(format!("Unknown task {id}"))),
        }
        let mut graph = self.core.graph.lock();
        graph.add_dependency(id, depends_on)?;
        if let Err(e) = self.core.queue.add_dependency(id, depends_on) {
            graph.remove_dependency(id, depends_on);
            return Err(e);
        }
        Ok(())
    }

    /// Cancel a task that has not been handed to an agent.
    pub fn cancel_task(&self, id: TaskId) -> WeaveResult<()> {
        self.core.queue.cancel_task(id)?;
        self.core
            .record_status(id, TaskStatus::Cancelled, None);
        info!(task_id = %short_id(&id), "Task cancelled");
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.core.queue.get(id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.core.queue.all()
    }

    pub fn task_result(&self, id: TaskId) -> Option<Value> {
        self.core.queue.result(id)
    }

    /// Execution layers of the current graph.
    pub fn execution_plan(&self) -> WeaveResult<Vec<Vec<TaskId>>> {
        self.core.graph.lock().execution_layers()
    }

    pub fn topological_order(&self) -> WeaveResult<Vec<TaskId>> {
        self.core.graph.lock().topological_order()
    }

    /// Combine candidate results with the given strategy.
    pub fn aggregate(
        &self,
        candidates: &[Candidate],
        strategy: AggregationStrategy,
    ) -> WeaveResult<Value> {
        self.aggregator.aggregate(candidates, strategy)
    }

    // ---- Scheduling loop ----

    /// Run scheduling passes until no task is unfinished or `max_iterations`
    /// passes have been made.
    pub async fn execute_all(&self, max_iterations: usize) -> ExecutionSummary {
        self.running.store(true, Ordering::SeqCst);
        info!(
            tasks = self.core.queue.len(),
            agents = self.core.registry.len(),
            max_iterations,
            "Execution started"
        );

        let mut iterations = 0;
        while iterations < max_iterations && self.core.queue.has_unfinished() {
            iterations += 1;
            self.sync_worker_status();
            self.promote_ready();
            if self.core.config.cascade_cancel {
                self.cascade_cancel();
            }
            if !self.core.queue.has_unfinished() {
                break;
            }

            let (batch, unassigned) = self.pull_batch().await;
            if batch.is_empty() {
                if !unassigned.is_empty() {
                    tokio::time::sleep(self.core.config.poll_interval()).await;
                }
                continue;
            }

            let mut attempts = JoinSet::new();
            for (task, agent_id) in batch {
                attempts.spawn(self.core.clone().dispatch(task, agent_id));
            }
            while let Some(joined) = attempts.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Dispatch task aborted");
                }
            }
        }

        if let Err(e) = self.core.state.flush().await {
            warn!(error = %e, "Shared state flush failed");
        }
        self.running.store(false, Ordering::SeqCst);

        let summary = self.summarize(iterations);
        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled.len(),
            pending = summary.pending.len(),
            iterations,
            stalled = summary.stalled,
            "Execution finished"
        );
        summary
    }

    /// PENDING tasks whose prerequisites have all completed become READY.
    fn promote_ready(&self) {
        let ready = self.core.graph.lock().ready();
        for id in ready {
            if self.core.queue.status(id) == Some(TaskStatus::Pending) {
                if let Err(e) = self.core.queue.mark_ready(id) {
                    debug!(task_id = %short_id(&id), error = %e, "Promotion skipped");
                }
            }
        }
    }

    /// Cancel every unstarted task downstream of a failed or cancelled one.
    fn cascade_cancel(&self) {
        let mut dead = self.core.queue.ids_with_status(TaskStatus::Failed);
        dead.extend(self.core.queue.ids_with_status(TaskStatus::Cancelled));
        if dead.is_empty() {
            return;
        }

        let mut doomed = Vec::new();
        let mut seen = HashSet::new();
        {
            let graph = self.core.graph.lock();
            for id in &dead {
                for dependent in graph.transitive_dependents(*id) {
                    if seen.insert(dependent)
                        && matches!(
                            self.core.queue.status(dependent),
                            Some(TaskStatus::Pending | TaskStatus::Ready)
                        )
                    {
                        doomed.push(dependent);
                    }
                }
            }
        }

        for id in doomed {
            match self.core.queue.cancel_task(id) {
                Ok(()) => {
                    self.core.record_status(id, TaskStatus::Cancelled, None);
                    info!(task_id = %short_id(&id), "Cancelled dependent of an unfinished prerequisite");
                }
                Err(e) => debug!(task_id = %short_id(&id), error = %e, "Cascade cancel skipped"),
            }
        }
    }

    /// Pull up to `max_parallel_dispatch` ready tasks and reserve an agent for
    /// each. Tasks without an eligible agent go back to READY.
    async fn pull_batch(&self) -> (Vec<(Task, AgentId)>, Vec<TaskId>) {
        let mut batch = Vec::new();
        let mut unassigned = Vec::new();
        let mut wait = self.core.config.poll_interval();

        while batch.len() < self.core.config.max_parallel_dispatch.max(1) {
            let Some(task) = self.core.queue.next_task(wait).await else {
                break;
            };
            wait = Duration::ZERO;
            match self.core.registry.assign(&task.capability) {
                Ok(agent) => batch.push((task, agent.id)),
                Err(e) => {
                    debug!(task_id = %short_id(&task.id), error = %e, "Task left unassigned");
                    unassigned.push(task.id);
                }
            }
        }

        for id in &unassigned {
            if let Err(e) = self.core.queue.requeue(*id) {
                warn!(task_id = %short_id(id), error = %e, "Could not requeue task");
            }
        }
        (batch, unassigned)
    }

    fn summarize(&self, iterations: usize) -> ExecutionSummary {
        let mut tasks = self.core.queue.all();
        tasks.sort_by_key(|t| t.sequence);

        let mut summary = ExecutionSummary {
            iterations,
            ..ExecutionSummary::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Completed => summary.completed.push(task.id),
                TaskStatus::Failed => summary.failed.push(task.id),
                TaskStatus::Cancelled => summary.cancelled.push(task.id),
                _ => summary.pending.push(task.id),
            }
        }
        summary.stalled = !summary.pending.is_empty();
        summary
    }

    /// Statistics from every subsystem.
    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            timestamp: Utc::now(),
            running: self.is_running(),
            queue: self.core.queue.statistics(),
            registry: self.core.registry.statistics(),
            graph: self.core.graph.lock().statistics(),
            channel: self.core.channel.statistics(),
            state: self.core.state.statistics(),
        }
    }

    /// Forget every task. Registered agents stay.
    pub fn reset(&self) {
        let mut graph = self.core.graph.lock();
        graph.clear();
        self.core.queue.clear();
        info!("Orchestrator reset");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.core.channel.close_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use async_trait::async_trait;

    struct Echo {
        id: String,
        caps: Vec<String>,
    }

    impl Echo {
        fn new(id: &str, caps: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                caps: caps.iter().map(|c| c.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl Worker for Echo {
        fn id(&self) -> &str {
            &self.id
        }
        fn worker_type(&self) -> &str {
            "echo"
        }
        fn capabilities(&self) -> Vec<String> {
            self.caps.clone()
        }
        async fn process(&self, request: WorkRequest) -> WeaveResult<Value> {
            Ok(json!({ "agent": self.id, "input": request.input }))
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig::default().with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_add_task_validation() {
        let orch = Orchestrator::new(fast_config());
        assert!(matches!(
            orch.add_task(TaskRequest::new("  ", "go")),
            Err(WeaveError::Validation(_))
        ));
        let ghost = uuid::Uuid::new_v4();
        assert!(matches!(
            orch.add_task(TaskRequest::new("write", "go").depends_on(ghost)),
            Err(WeaveError::Validation(_))
        ));
        assert!(orch.tasks().is_empty());
        assert!(orch.execution_plan().unwrap().is_empty());
    }

    fn in_progress(orch: &Orchestrator, request: TaskRequest) -> Task {
        let id = orch.add_task(request).unwrap();
        orch.core.queue.mark_ready(id).unwrap();
        let task = orch.core.queue.try_next().unwrap();
        orch.core.queue.mark_in_progress(id, "e1").unwrap();
        task
    }

    #[tokio::test]
    async fn test_only_task_failures_consume_retries() {
        let orch = Orchestrator::new(fast_config());
        orch.register_agent(Echo::new("e1", &["echo"])).unwrap();

        let flaky = in_progress(&orch, TaskRequest::new("echo", "a").with_max_retries(2));
        let reason = WeaveError::TaskExecution {
            task_id: flaky.id,
            reason: "boom".into(),
        };
        orch.core.finish(&flaky, "e1", Err(reason));
        let after = orch.core.queue.get(flaky.id).unwrap();
        assert_eq!(after.status, TaskStatus::Ready);
        assert_eq!(after.retry_count, 1);

        let broken = in_progress(&orch, TaskRequest::new("echo", "b").with_max_retries(2));
        orch.core.finish(&broken, "e1", Err(WeaveError::Validation("bad input".into())));
        let after = orch.core.queue.get(broken.id).unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.retry_count, 0);
        assert!(after.error.unwrap().contains("bad input"));
    }

    #[test]
    fn test_add_dependency_rejects_cycle() {
        let orch = Orchestrator::new(fast_config());
        let a = orch.add_task(TaskRequest::new("x", "a")).unwrap();
        let b = orch.add_task(TaskRequest::new("x", "b").depends_on(a)).unwrap();
        assert!(matches!(
            orch.add_dependency(a, b),
            Err(WeaveError::CircularDependency(_))
        ));
        assert_eq!(orch.task(a).unwrap().status, TaskStatus::Ready);
        assert!(orch.task(a).unwrap().dependencies.is_empty());
        assert_eq!(orch.execution_plan().unwrap(), vec![vec![a], vec![b]]);
    }

    #[test]
    fn test_add_dependency_demotes_ready_task() {
        let orch = Orchestrator::new(fast_config());
        let a = orch.add_task(TaskRequest::new("x", "a")).unwrap();
        let b = orch.add_task(TaskRequest::new("x", "b")).unwrap();
        orch.add_dependency(b, a).unwrap();
        assert_eq!(orch.task(b).unwrap().status, TaskStatus::Pending);
        assert_eq!(orch.topological_order().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_reserved_agent_id() {
        let orch = Orchestrator::new(fast_config());
        assert!(orch
            .register_agent(Echo::new(ORCHESTRATOR_ID, &["x"]))
            .is_err());
    }

    #[tokio::test]
    async fn test_single_task_runs_and_records_result() {
        let orch = Orchestrator::new(fast_config());
        orch.register_agent(Echo::new("e1", &["echo"])).unwrap();
        let id = orch
            .add_task(
                TaskRequest::new("echo", "say")
                    .with_input(json!("hi"))
                    .with_priority(Priority::High),
            )
            .unwrap();

        let summary = orch.execute_all(20).await;
        assert_eq!(summary.completed, vec![id]);
        assert!(summary.is_success());
        assert_eq!(orch.task_result(id).unwrap()["input"], json!("hi"));

        let stored = orch.shared_state().read(&format!("result:{id}")).unwrap();
        assert_eq!(stored["agent"], json!("e1"));
        let agent = orch.registry().get("e1").unwrap();
        assert_eq!(agent.load, 0);
        assert_eq!(agent.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_task_events_are_broadcast() {
        let orch = Orchestrator::new(fast_config());
        orch.register_agent(Echo::new("e1", &["echo"])).unwrap();
        orch.channel().open_mailbox("watcher");
        orch.channel().subscribe("watcher", TASK_EVENTS_TOPIC);
        let id = orch.add_task(TaskRequest::new("echo", "say")).unwrap();

        orch.execute_all(20).await;
        let event = orch.channel().try_receive("watcher").unwrap();
        assert_eq!(event.kind, MessageKind::Notification);
        assert_eq!(event.payload["task_id"], json!(id));
        assert_eq!(event.payload["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_unregistered_agent_gets_no_work() {
        let orch = Orchestrator::new(fast_config());
        orch.register_agent(Echo::new("e1", &["echo"])).unwrap();
        orch.unregister_agent("e1").unwrap();
        assert!(!orch.channel().is_open("e1"));

        let id = orch.add_task(TaskRequest::new("echo", "say")).unwrap();
        let summary = orch.execute_all(3).await;
        assert!(summary.stalled);
        assert_eq!(summary.pending, vec![id]);
        assert_eq!(orch.task(id).unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_system_status_serializes() {
        let orch = Orchestrator::new(fast_config());
        orch.register_agent(Echo::new("e1", &["echo"])).unwrap();
        orch.add_task(TaskRequest::new("echo", "say")).unwrap();
        orch.execute_all(20).await;

        let status = orch.system_status();
        assert!(!status.running);
        assert_eq!(status.queue.succeeded, 1);
        assert_eq!(status.registry.total_agents, 1);
        assert_eq!(status.graph.completed, 1);
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("channel").is_some());
        assert!(json.get("state").is_some());
    }

    #[test]
    fn test_into_result_reports_stuck_ids() {
        let stuck = uuid::Uuid::new_v4();
        let summary = ExecutionSummary {
            pending: vec![stuck],
            stalled: true,
            ..ExecutionSummary::default()
        };
        match summary.into_result() {
            Err(WeaveError::SchedulingStalled { task_ids }) => assert_eq!(task_ids, vec![stuck]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ExecutionSummary::default().into_result().is_ok());
    }
}
