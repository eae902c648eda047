use crate::types::{Priority, Task, TaskRequest, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use weave_core::{short_id, TaskId, WeaveError, WeaveResult};

/// Counts reported by [`TaskQueue::statistics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub ready: usize,
    /// Assigned or in progress.
    pub in_progress: usize,
    /// Succeeded over total submitted, 0.0 for an empty queue.
    pub success_rate: f64,
}

type HeapEntry = Reverse<(Priority, u64, TaskId)>;

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    /// READY tasks ordered by (priority, sequence). Entries whose task left
    /// READY are skipped when popped.
    ready: BinaryHeap<HeapEntry>,
    next_sequence: u64,
}

impl QueueState {
    fn push_ready(&mut self, task: &Task) {
        self.ready.push(Reverse((task.priority, task.sequence, task.id)));
    }

    fn pop_ready(&mut self) -> Option<Task> {
        while let Some(Reverse((_, _, id))) = self.ready.pop() {
            if let Some(task) = self.tasks.get_mut(&id) {
                if task.status == TaskStatus::Ready {
                    task.status = TaskStatus::Assigned;
                    return Some(task.clone());
                }
            }
        }
        None
    }

    fn transition(
        &mut self,
        id: TaskId,
        from: &[TaskStatus],
        to: TaskStatus,
    ) -> WeaveResult<&mut Task> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| WeaveError::Validation(format!("Unknown task {id}")))?;
        if !from.contains(&task.status) {
            return Err(WeaveError::Validation(format!(
                "Task {} cannot move from {} to {}",
                short_id(&id),
                task.status,
                to
            )));
        }
        task.status = to;
        Ok(task)
    }
}

/// Priority queue of tasks plus the lifecycle state of every submitted task.
///
/// READY tasks are served smallest priority first, in submission order within
/// a priority band. Every state transition goes through this type, and the
/// internal lock is never held across an await point.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Submit a task built from `request`.
    pub fn add_task(&self, request: TaskRequest) -> WeaveResult<Task> {
        self.insert(Task::from_request(request))
    }

    /// Submit a pre-built task. It starts READY when it has no dependencies
    /// and PENDING otherwise.
    pub fn insert(&self, mut task: Task) -> WeaveResult<Task> {
        let ready = {
            let mut state = self.state.lock();
            if state.tasks.contains_key(&task.id) {
                return Err(WeaveError::Validation(format!(
                    "Task {} already submitted",
                    task.id
                )));
            }
            task.sequence = state.next_sequence;
            state.next_sequence += 1;
            task.status = if task.dependencies.is_empty() {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };
            if task.status == TaskStatus::Ready {
                state.push_ready(&task);
            }
            state.tasks.insert(task.id, task.clone());
            task.status == TaskStatus::Ready
        };

        debug!(
            task_id = %short_id(&task.id),
            capability = %task.capability,
            priority = %task.priority,
            status = %task.status,
            "Task queued"
        );
        if ready {
            self.notify.notify_one();
        }
        Ok(task)
    }

    /// Pop the highest-priority READY task, waiting up to `timeout` for one.
    /// The returned task is ASSIGNED.
    pub async fn next_task(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.state.lock().pop_ready() {
                return Some(task);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.state.lock().pop_ready();
            }
        }
    }

    /// Pop without waiting.
    pub fn try_next(&self) -> Option<Task> {
        self.state.lock().pop_ready()
    }

    /// PENDING -> READY once dependencies are satisfied.
    pub fn mark_ready(&self, id: TaskId) -> WeaveResult<()> {
        {
            let mut state = self.state.lock();
            let task = state
                .transition(id, &[TaskStatus::Pending], TaskStatus::Ready)?
                .clone();
            state.push_ready(&task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// READY -> PENDING, used when a new dependency is added after submission.
    pub fn mark_pending(&self, id: TaskId) -> WeaveResult<()> {
        self.state
            .lock()
            .transition(id, &[TaskStatus::Ready], TaskStatus::Pending)?;
        Ok(())
    }

    /// Record an extra prerequisite on a task that has not been handed out.
    /// A READY task drops back to PENDING until the scheduler promotes it.
    pub fn add_dependency(&self, id: TaskId, depends_on: TaskId) -> WeaveResult<()> {
        let mut state = self.state.lock();
        let task = state.transition(
            id,
            &[TaskStatus::Pending, TaskStatus::Ready],
            TaskStatus::Pending,
        )?;
        if !task.dependencies.contains(&depends_on) {
            task.dependencies.push(depends_on);
        }
        Ok(())
    }

    /// ASSIGNED -> IN_PROGRESS on `agent_id`.
    pub fn mark_in_progress(&self, id: TaskId, agent_id: &str) -> WeaveResult<()> {
        let mut state = self.state.lock();
        let task = state.transition(id, &[TaskStatus::Assigned], TaskStatus::InProgress)?;
        task.assigned_agent = Some(agent_id.to_string());
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// ASSIGNED -> READY, keeping the task's place in its priority band.
    pub fn requeue(&self, id: TaskId) -> WeaveResult<()> {
        {
            let mut state = self.state.lock();
            let task = state
                .transition(id, &[TaskStatus::Assigned], TaskStatus::Ready)?
                .clone();
            state.push_ready(&task);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// IN_PROGRESS -> READY for another attempt. Returns the new retry count.
    pub fn retry(&self, id: TaskId, error: impl Into<String>) -> WeaveResult<u32> {
        let retry_count = {
            let mut state = self.state.lock();
            let task = state.transition(id, &[TaskStatus::InProgress], TaskStatus::Ready)?;
            task.retry_count += 1;
            task.error = Some(error.into());
            task.assigned_agent = None;
            task.started_at = None;
            let task = task.clone();
            state.push_ready(&task);
            task.retry_count
        };
        self.notify.notify_one();
        Ok(retry_count)
    }

    pub fn complete_task(&self, id: TaskId, result: serde_json::Value) -> WeaveResult<()> {
        let mut state = self.state.lock();
        let task = state.transition(id, &[TaskStatus::InProgress], TaskStatus::Completed)?;
        task.result = Some(result);
        task.error = None;
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail_task(&self, id: TaskId, error: impl Into<String>) -> WeaveResult<()> {
        let mut state = self.state.lock();
        let task = state.transition(
            id,
            &[TaskStatus::Assigned, TaskStatus::InProgress],
            TaskStatus::Failed,
        )?;
        task.error = Some(error.into());
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Cancel a task that has not been handed to an agent yet.
    pub fn cancel_task(&self, id: TaskId) -> WeaveResult<()> {
        let mut state = self.state.lock();
        let task = state.transition(
            id,
            &[TaskStatus::Pending, TaskStatus::Ready],
            TaskStatus::Cancelled,
        )?;
        task.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.state.lock().tasks.get(&id).cloned()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.state.lock().tasks.contains_key(&id)
    }

    /// Result of a completed task.
    pub fn result(&self, id: TaskId) -> Option<serde_json::Value> {
        let state = self.state.lock();
        let task = state.tasks.get(&id)?;
        if task.status == TaskStatus::Completed {
            task.result.clone()
        } else {
            None
        }
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.state.lock().tasks.get(&id).map(|t| t.status)
    }

    /// All tasks in submission order.
    pub fn all(&self) -> Vec<Task> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.filtered(|t| t.status == status)
    }

    pub fn tasks_by_capability(&self, capability: &str) -> Vec<Task> {
        self.filtered(|t| t.capability == capability)
    }

    /// Ids with `status`, in submission order.
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks_by_status(status).into_iter().map(|t| t.id).collect()
    }

    fn filtered(&self, pred: impl Fn(&Task) -> bool) -> Vec<Task> {
        let state = self.state.lock();
        let mut tasks: Vec<Task> = state.tasks.values().filter(|t| pred(t)).cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Whether any task is still PENDING, READY, ASSIGNED or IN_PROGRESS.
    pub fn has_unfinished(&self) -> bool {
        self.state
            .lock()
            .tasks
            .values()
            .any(|t| !t.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> QueueStatistics {
        let state = self.state.lock();
        let mut stats = QueueStatistics {
            total: state.tasks.len(),
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::Assigned | TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.succeeded as f64 / stats.total as f64;
        }
        stats
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.tasks.clear();
        state.ready.clear();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
