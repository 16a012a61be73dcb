use crate::config::QueueConfig;
use chrono::{DateTime, Utc};
use colony_core::{
    ColonyError, ColonyResult, LatencyPercentiles, Priority, Signal, SignalBus, Task, TaskOptions,
    TaskStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Returned by a successful [`TaskQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub task_id: Uuid,
    pub priority: Priority,
    /// 1-based dispatch position at enqueue time.
    pub position: usize,
}

/// What [`TaskQueue::mark_failed`] did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum FailureDisposition {
    /// Re-enqueued at the back of its priority bucket.
    Retrying { retry_count: u32 },
    /// Retries exhausted; moved to the dead-letter queue.
    DeadLettered,
}

/// A task that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterTask {
    pub task: Task,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Queued tasks per priority bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub queued: usize,
    pub in_progress: usize,
    pub depth: QueueDepth,
    pub total_enqueued: u64,
    pub completed: u64,
    /// Failed attempts, including ones that were retried.
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub dead_letter_size: usize,
    /// Enqueue-to-completion latency over every completed task.
    pub latency: LatencyPercentiles,
}

/// One dispatch of a task: the agent it went to and the retry it ran as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt<'a> {
    pub agent_id: &'a str,
    pub retry_count: u32,
}

impl<'a> Attempt<'a> {
    pub fn new(agent_id: &'a str, retry_count: u32) -> Self {
        Self {
            agent_id,
            retry_count,
        }
    }

    fn matches(&self, task: &Task) -> bool {
        task.assigned_agent.as_deref() == Some(self.agent_id) && task.retry_count == self.retry_count
    }
}

/// What a failed attempt did, for signalling once the lock is released.
struct Failure {
    task_id: Uuid,
    error: String,
    retry_count: u32,
    disposition: FailureDisposition,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    dead_lettered: u64,
    timed_out: u64,
    cancelled: u64,
}

#[derive(Default)]
struct QueueState {
    /// Indexed by `Priority::rank()`.
    buckets: [VecDeque<Task>; 3],
    in_progress: HashMap<Uuid, Task>,
    history: VecDeque<Task>,
    dead_letters: VecDeque<DeadLetterTask>,
    latencies: Vec<u64>,
    counters: Counters,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Remove an in-progress task, provided `attempt` (if any) is the one running.
    fn take_in_progress(
        &mut self,
        task_id: Uuid,
        attempt: Option<Attempt<'_>>,
    ) -> ColonyResult<Task> {
        let task = self
            .in_progress
            .get(&task_id)
            .ok_or_else(|| not_in_progress(task_id))?;
        if let Some(attempt) = attempt {
            if !attempt.matches(task) {
                return Err(ColonyError::NotFound(format!(
                    "task {task_id} is not running as attempt {} on {}",
                    attempt.retry_count, attempt.agent_id
                )));
            }
        }
        self.in_progress
            .remove(&task_id)
            .ok_or_else(|| not_in_progress(task_id))
    }

    /// Requeue `task` or dead-letter it once its retries are spent.
    fn fail(&mut self, mut task: Task, error: String) -> Failure {
        task.error = Some(error.clone());
        self.counters.failed += 1;
        let disposition = if task.can_retry() {
            task.retry_count += 1;
            task.status = TaskStatus::Queued;
            task.started_at = None;
            task.assigned_agent = None;
            self.counters.retried += 1;
            let retry_count = task.retry_count;
            self.buckets[task.priority.rank()].push_back(task.clone());
            FailureDisposition::Retrying { retry_count }
        } else {
            task.status = TaskStatus::DeadLettered;
            self.counters.dead_lettered += 1;
            self.dead_letters.push_back(DeadLetterTask {
                task: task.clone(),
                reason: error.clone(),
                failed_at: Utc::now(),
            });
            FailureDisposition::DeadLettered
        };
        Failure {
            task_id: task.id,
            error,
            retry_count: task.retry_count,
            disposition,
        }
    }

    /// Queued tasks that dispatch no later than the back of `priority`'s bucket.
    fn position_of_back(&self, priority: Priority) -> usize {
        self.buckets[..=priority.rank()]
            .iter()
            .map(VecDeque::len)
            .sum()
    }
}

struct QueueInner {
    config: QueueConfig,
    signals: SignalBus,
    state: Mutex<QueueState>,
    requeued: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Priority task queue with retries, timeouts, and a dead-letter queue.
///
/// Every task lives in exactly one of: a priority bucket, the in-progress
/// set, the completed history, or the dead-letter queue. All mutations go
/// through a single lock.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, signals: SignalBus) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                signals,
                state: Mutex::new(QueueState::default()),
                requeued: Notify::new(),
                sweeper: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Validate and enqueue a new task behind every task of equal or higher priority.
    pub fn enqueue(
        &self,
        name: impl Into<String>,
        content: serde_json::Value,
        options: TaskOptions,
    ) -> ColonyResult<EnqueueReceipt> {
        if self.is_stopped() {
            return Err(ColonyError::Shutdown("task queue is stopped".into()));
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ColonyError::Validation("task name must not be empty".into()));
        }
        let task = Task::new(
            name,
            content,
            options,
            self.inner.config.default_max_retries,
            self.inner.config.task_timeout_ms,
        );
        if task.timeout_ms == 0 {
            return Err(ColonyError::Validation("task timeout must be positive".into()));
        }

        let mut state = self.inner.state.lock();
        let max = self.inner.config.max_queue_size;
        if state.queued() >= max {
            return Err(ColonyError::Capacity(format!(
                "task queue is full ({max} tasks)"
            )));
        }
        let receipt = EnqueueReceipt {
            task_id: task.id,
            priority: task.priority,
            position: state.position_of_back(task.priority) + 1,
        };
        debug!(
            task_id = %task.id,
            name = %task.name,
            priority = %task.priority,
            position = receipt.position,
            "Task enqueued"
        );
        state.buckets[task.priority.rank()].push_back(task);
        state.counters.enqueued += 1;
        Ok(receipt)
    }

    /// Pop the highest-priority, oldest task and move it into the in-progress set.
    pub fn dequeue(&self) -> Option<Task> {
        let mut state = self.inner.state.lock();
        let mut task = state.buckets.iter_mut().find_map(VecDeque::pop_front)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        state.in_progress.insert(task.id, task.clone());
        Some(task)
    }

    /// Record which agent runs an in-progress task. Restarts its timeout clock.
    pub fn mark_started(&self, task_id: Uuid, agent_id: &str) -> ColonyResult<()> {
        let mut state = self.inner.state.lock();
        let task = state
            .in_progress
            .get_mut(&task_id)
            .ok_or_else(|| not_in_progress(task_id))?;
        task.assigned_agent = Some(agent_id.to_string());
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// Move an in-progress task into the completed history.
    ///
    /// With an `attempt`, the call only applies when it names the agent and
    /// retry the task is currently running as; results of superseded attempts
    /// are rejected with `NotFound`.
    pub fn mark_completed(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
        attempt: Option<Attempt<'_>>,
    ) -> ColonyResult<Task> {
        let (task, latency_ms) = {
            let mut state = self.inner.state.lock();
            let mut task = state.take_in_progress(task_id, attempt)?;
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.result = Some(result);
            task.error = None;
            let latency_ms = task.latency_ms().unwrap_or_default();
            state.latencies.push(latency_ms);
            state.counters.completed += 1;
            let limit = self.inner.config.history_size;
            if limit > 0 {
                state.history.push_back(task.clone());
                while state.history.len() > limit {
                    state.history.pop_front();
                }
            }
            (task, latency_ms)
        };
        debug!(task_id = %task_id, latency_ms, "Task completed");
        self.inner.signals.emit(Signal::TaskCompleted {
            task_id,
            agent_id: task.assigned_agent.clone(),
            latency_ms,
        });
        Ok(task)
    }

    /// Record a failed attempt. Retries while `retry_count < max_retries`,
    /// otherwise dead-letters the task.
    ///
    /// `attempt` is matched the same way as in [`TaskQueue::mark_completed`].
    pub fn mark_failed(
        &self,
        task_id: Uuid,
        error: &str,
        attempt: Option<Attempt<'_>>,
    ) -> ColonyResult<FailureDisposition> {
        let failure = {
            let mut state = self.inner.state.lock();
            let task = state.take_in_progress(task_id, attempt)?;
            state.fail(task, error.to_string())
        };
        if let Some(attempt) = attempt {
            debug!(
                task_id = %task_id,
                agent_id = %attempt.agent_id,
                retry_count = attempt.retry_count,
                error = %error,
                "Task attempt failed"
            );
        }
        let disposition = failure.disposition;
        self.announce(failure);
        Ok(disposition)
    }

    fn announce(&self, failure: Failure) {
        let will_retry = matches!(failure.disposition, FailureDisposition::Retrying { .. });
        self.inner.signals.emit(Signal::TaskFailed {
            task_id: failure.task_id,
            error: failure.error.clone(),
            retry_count: failure.retry_count,
            will_retry,
        });
        if will_retry {
            debug!(task_id = %failure.task_id, retry_count = failure.retry_count, "Task re-queued for retry");
            self.inner.requeued.notify_one();
        } else {
            warn!(
                task_id = %failure.task_id,
                retries = failure.retry_count,
                error = %failure.error,
                "Task dead-lettered"
            );
            self.inner.signals.emit(Signal::TaskDeadLettered {
                task_id: failure.task_id,
                reason: failure.error,
            });
        }
    }

    /// Fail every in-progress task whose timeout has elapsed. Returns their ids.
    pub fn sweep_timeouts(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let failures: Vec<Failure> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<Uuid> = state
                .in_progress
                .values()
                .filter(|t| t.is_timed_out(now))
                .map(|t| t.id)
                .collect();
            state.counters.timed_out += ids.len() as u64;
            let mut failures = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(task) = state.in_progress.remove(&id) {
                    let msg = format!("task timed out after {}ms", task.timeout_ms);
                    failures.push(state.fail(task, msg));
                }
            }
            failures
        };
        failures
            .into_iter()
            .map(|failure| {
                let id = failure.task_id;
                self.announce(failure);
                id
            })
            .collect()
    }

    /// Wait until a failed or timed-out task has been put back into a bucket.
    ///
    /// A requeue that happens while nobody waits is remembered for the next call.
    pub async fn requeued(&self) {
        self.inner.requeued.notified().await;
    }

    /// Remove a task that is still waiting in a priority bucket.
    pub fn cancel(&self, task_id: Uuid) -> Option<Task> {
        let mut state = self.inner.state.lock();
        let task = state.buckets.iter_mut().find_map(|bucket| {
            let idx = bucket.iter().position(|t| t.id == task_id)?;
            bucket.remove(idx)
        })?;
        state.counters.cancelled += 1;
        debug!(task_id = %task_id, "Queued task cancelled");
        Some(task)
    }

    /// Drop an in-progress task that was cancelled before it started running.
    pub fn cancel_in_progress(&self, task_id: Uuid) -> Option<Task> {
        let mut state = self.inner.state.lock();
        let task = state.in_progress.remove(&task_id)?;
        state.counters.cancelled += 1;
        Some(task)
    }

    /// Return an in-progress task to the front of its bucket without
    /// consuming a retry.
    pub fn release(&self, task_id: Uuid) -> bool {
        let mut state = self.inner.state.lock();
        let Some(mut task) = state.in_progress.remove(&task_id) else {
            return false;
        };
        task.status = TaskStatus::Queued;
        task.started_at = None;
        task.assigned_agent = None;
        state.buckets[task.priority.rank()].push_front(task);
        true
    }

    /// Look a task up wherever it currently lives.
    pub fn get_task(&self, task_id: Uuid) -> Option<Task> {
        let state = self.inner.state.lock();
        state
            .buckets
            .iter()
            .flatten()
            .chain(state.in_progress.values())
            .chain(state.history.iter())
            .chain(state.dead_letters.iter().map(|d| &d.task))
            .find(|t| t.id == task_id)
            .cloned()
    }

    /// Completed tasks, oldest first.
    pub fn history(&self) -> Vec<Task> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    pub fn dead_letter_queue(&self) -> Vec<DeadLetterTask> {
        self.inner.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn clear_dead_letter_queue(&self) -> usize {
        let mut state = self.inner.state.lock();
        let n = state.dead_letters.len();
        state.dead_letters.clear();
        n
    }

    /// Number of queued (not in-progress) tasks.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queued()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_progress_count(&self) -> usize {
        self.inner.state.lock().in_progress.len()
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.inner.state.lock();
        QueueDepth {
            high: state.buckets[Priority::High.rank()].len(),
            normal: state.buckets[Priority::Normal.rank()].len(),
            low: state.buckets[Priority::Low.rank()].len(),
        }
    }

    pub fn get_queue_statistics(&self) -> QueueStatistics {
        let state = self.inner.state.lock();
        QueueStatistics {
            queued: state.queued(),
            in_progress: state.in_progress.len(),
            depth: QueueDepth {
                high: state.buckets[Priority::High.rank()].len(),
                normal: state.buckets[Priority::Normal.rank()].len(),
                low: state.buckets[Priority::Low.rank()].len(),
            },
            total_enqueued: state.counters.enqueued,
            completed: state.counters.completed,
            failed: state.counters.failed,
            retried: state.counters.retried,
            dead_lettered: state.counters.dead_lettered,
            timed_out: state.counters.timed_out,
            cancelled: state.counters.cancelled,
            dead_letter_size: state.dead_letters.len(),
            latency: LatencyPercentiles::from_samples(&state.latencies),
        }
    }

    /// Arm the periodic timeout sweep. Idempotent.
    pub fn start(&self) {
        if self.is_stopped() {
            return;
        }
        let mut slot = self.inner.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.sweep_interval_ms.max(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let queue = TaskQueue { inner };
                if queue.is_stopped() {
                    break;
                }
                let expired = queue.sweep_timeouts();
                if !expired.is_empty() {
                    warn!(count = expired.len(), "Timed-out tasks failed");
                }
            }
        }));
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the sweep and reject new tasks. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        info!(queued = self.len(), "Task queue stopped");
    }
}

fn not_in_progress(task_id: Uuid) -> ColonyError {
    ColonyError::NotFound(format!("task {task_id} is not in progress"))
}
