use crate::config::AgentConfig;
use crate::directory::MessageRecipient;
use crate::handler::TaskHandler;
use crate::store::{AgentSnapshot, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::{
    ColonyError, ColonyResult, MessageEnvelope, Signal, SignalBus, Task, TaskStatus,
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Initializing,
    Ready,
    Executing,
    Paused,
    Terminated,
}

impl AgentState {
    /// Whether new tasks may start right away in this state.
    pub fn accepts_work(self) -> bool {
        matches!(self, AgentState::Ready | AgentState::Executing)
    }
}

/// Result of handing a task to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecuteOutcome {
    Started,
    /// The agent was at its concurrency limit; the task waits in its overflow queue.
    Queued { position: usize },
}

/// Reported once per task that ran to completion or failure on an agent.
///
/// Cancelled or abandoned tasks produce no completion.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub agent_id: String,
    /// The task with `status`, `result`, and `error` filled in.
    pub task: Task,
    pub duration_ms: u64,
}

impl TaskCompletion {
    pub fn succeeded(&self) -> bool {
        self.task.status == TaskStatus::Completed
    }
}

/// Point-in-time view of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: String,
    pub name: String,
    pub rank: u32,
    pub state: AgentState,
    pub uptime_ms: u64,
    pub task_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Successful share of finished tasks; 1.0 before anything finished.
    pub success_rate: f64,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub inbox_len: usize,
    pub last_heartbeat: DateTime<Utc>,
    pub last_task_duration_ms: Option<u64>,
}

/// Emitted when an agent terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_tasks: u64,
    pub uptime_ms: u64,
    /// Tasks that were running and have been abandoned.
    pub abandoned_tasks: Vec<Uuid>,
    /// Tasks that were waiting in the overflow queue and never started.
    pub pending_tasks: Vec<Uuid>,
}

struct AgentCore {
    state: AgentState,
    running: HashMap<Uuid, AbortHandle>,
    overflow: VecDeque<Task>,
    inbox: VecDeque<MessageEnvelope>,
    task_count: u64,
    success_count: u64,
    failure_count: u64,
    messages_sent: u64,
    messages_received: u64,
    last_heartbeat: DateTime<Utc>,
    last_task_duration_ms: Option<u64>,
    summary: Option<AgentSummary>,
}

struct AgentInner {
    id: String,
    name: String,
    rank: u32,
    config: AgentConfig,
    handler: Arc<dyn TaskHandler>,
    signals: SignalBus,
    store: Option<Arc<dyn StateStore>>,
    completions: Option<mpsc::UnboundedSender<TaskCompletion>>,
    born: Instant,
    core: Mutex<AgentCore>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// A concurrent worker unit executing assigned tasks.
///
/// `Agent` is a cheap handle; clones share the same worker.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    id: String,
    name: Option<String>,
    rank: u32,
    config: AgentConfig,
    handler: Arc<dyn TaskHandler>,
    signals: Option<SignalBus>,
    store: Option<Arc<dyn StateStore>>,
    completions: Option<mpsc::UnboundedSender<TaskCompletion>>,
}

impl AgentBuilder {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_signals(mut self, signals: SignalBus) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Where finished tasks are reported.
    pub fn with_completion_sink(mut self, tx: mpsc::UnboundedSender<TaskCompletion>) -> Self {
        self.completions = Some(tx);
        self
    }

    pub fn build(self) -> Agent {
        let mut config = self.config;
        config.max_concurrent_tasks = config.max_concurrent_tasks.max(1);
        let name = self.name.unwrap_or_else(|| self.id.clone());
        Agent {
            inner: Arc::new(AgentInner {
                id: self.id,
                name,
                rank: self.rank,
                config,
                handler: self.handler,
                signals: self.signals.unwrap_or_default(),
                store: self.store,
                completions: self.completions,
                born: Instant::now(),
                core: Mutex::new(AgentCore {
                    state: AgentState::Initializing,
                    running: HashMap::new(),
                    overflow: VecDeque::new(),
                    inbox: VecDeque::new(),
                    task_count: 0,
                    success_count: 0,
                    failure_count: 0,
                    messages_sent: 0,
                    messages_received: 0,
                    last_heartbeat: Utc::now(),
                    last_task_duration_ms: None,
                    summary: None,
                }),
                heartbeat: Mutex::new(None),
            }),
        }
    }
}

impl Agent {
    pub fn builder(id: impl Into<String>, handler: Arc<dyn TaskHandler>) -> AgentBuilder {
        AgentBuilder {
            id: id.into(),
            name: None,
            rank: 0,
            config: AgentConfig::default(),
            handler,
            signals: None,
            store: None,
            completions: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn state(&self) -> AgentState {
        self.inner.core.lock().state
    }

    /// Load any persisted state, arm the heartbeat, and become `Ready`.
    ///
    /// Calling `start` on an already started agent is a no-op.
    pub async fn start(&self) -> ColonyResult<()> {
        match self.state() {
            AgentState::Initializing => {}
            AgentState::Terminated => {
                return Err(ColonyError::Shutdown(format!(
                    "agent {} is terminated",
                    self.inner.id
                )))
            }
            _ => return Ok(()),
        }

        let restored = match &self.inner.store {
            Some(store) => match store.load_state(&self.inner.id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(agent_id = %self.inner.id, error = %e, "Failed to load agent state, starting fresh");
                    None
                }
            },
            None => None,
        };

        self.arm_heartbeat();

        let mut core = self.inner.core.lock();
        if core.state != AgentState::Initializing {
            return Ok(());
        }
        if let Some(prior) = restored {
            debug!(agent_id = %self.inner.id, task_count = prior.task_count, "Restored agent state");
            core.task_count = prior.task_count;
            core.success_count = prior.success_count;
            core.failure_count = prior.failure_count;
            core.messages_sent = prior.messages_sent;
            core.messages_received = prior.messages_received;
        }
        core.state = AgentState::Ready;
        core.last_heartbeat = Utc::now();
        self.drain_overflow(&mut core);
        info!(agent_id = %self.inner.id, name = %self.inner.name, "Agent ready");
        Ok(())
    }

    /// Accept a task. Starts it immediately when below the concurrency limit,
    /// otherwise appends it to the overflow queue.
    pub fn execute(&self, task: Task) -> ColonyResult<ExecuteOutcome> {
        let mut core = self.inner.core.lock();
        if core.state == AgentState::Terminated {
            return Err(ColonyError::Shutdown(format!(
                "agent {} is terminated",
                self.inner.id
            )));
        }
        if core.running.contains_key(&task.id) || core.overflow.iter().any(|t| t.id == task.id) {
            return Err(ColonyError::Validation(format!(
                "task {} already assigned to agent {}",
                task.id, self.inner.id
            )));
        }

        if core.state.accepts_work() && core.running.len() < self.inner.config.max_concurrent_tasks
        {
            self.launch(&mut core, task);
            Ok(ExecuteOutcome::Started)
        } else {
            core.overflow.push_back(task);
            Ok(ExecuteOutcome::Queued {
                position: core.overflow.len(),
            })
        }
    }

    /// Remove a task that is still waiting in the overflow queue.
    ///
    /// Returns `false` if the task already started (or is unknown); in-flight
    /// work is never interrupted.
    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        let mut core = self.inner.core.lock();
        match core.overflow.iter().position(|t| t.id == task_id) {
            Some(idx) => {
                core.overflow.remove(idx);
                debug!(agent_id = %self.inner.id, task_id = %task_id, "Cancelled queued task");
                true
            }
            None => false,
        }
    }

    /// Stop starting new tasks. Running tasks continue.
    pub fn pause(&self) -> bool {
        let mut core = self.inner.core.lock();
        if core.state.accepts_work() {
            core.state = AgentState::Paused;
            true
        } else {
            false
        }
    }

    /// Resume a paused agent and drain its overflow queue.
    pub fn resume(&self) -> bool {
        let mut core = self.inner.core.lock();
        if core.state != AgentState::Paused {
            return false;
        }
        core.state = if core.running.is_empty() {
            AgentState::Ready
        } else {
            AgentState::Executing
        };
        self.drain_overflow(&mut core);
        true
    }

    /// Build an outgoing envelope from this agent. Delivery is the router's job.
    pub fn send_message(&self, to: impl Into<String>, content: serde_json::Value) -> MessageEnvelope {
        self.inner.core.lock().messages_sent += 1;
        MessageEnvelope::new(self.inner.id.clone(), to, content)
    }

    /// Accept an incoming envelope into the inbox.
    pub fn receive_message(&self, envelope: MessageEnvelope) -> ColonyResult<()> {
        let mut core = self.inner.core.lock();
        if core.state == AgentState::Terminated {
            return Err(ColonyError::Delivery(format!(
                "agent {} is terminated",
                self.inner.id
            )));
        }
        if core.inbox.len() >= self.inner.config.inbox_capacity {
            return Err(ColonyError::Delivery(format!(
                "inbox of agent {} is full ({})",
                self.inner.id, self.inner.config.inbox_capacity
            )));
        }
        core.inbox.push_back(envelope);
        core.messages_received += 1;
        Ok(())
    }

    /// Drain the inbox in arrival order.
    pub fn take_messages(&self) -> Vec<MessageEnvelope> {
        self.inner.core.lock().inbox.drain(..).collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.core.lock().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.core.lock().overflow.len()
    }

    /// Running plus locally queued tasks.
    pub fn load(&self) -> usize {
        let core = self.inner.core.lock();
        core.running.len() + core.overflow.len()
    }

    /// Whether a new task would start immediately.
    pub fn has_idle_capacity(&self) -> bool {
        let core = self.inner.core.lock();
        core.state.accepts_work()
            && core.overflow.is_empty()
            && core.running.len() < self.inner.config.max_concurrent_tasks
    }

    /// Whether the agent is live and its heartbeat is recent.
    pub fn is_healthy(&self) -> bool {
        let core = self.inner.core.lock();
        let silence = Utc::now()
            .signed_duration_since(core.last_heartbeat)
            .num_milliseconds();
        matches!(
            core.state,
            AgentState::Ready | AgentState::Executing | AgentState::Paused
        ) && silence <= self.inner.config.heartbeat_grace_ms() as i64
    }

    pub fn get_status(&self) -> AgentStatus {
        let core = self.inner.core.lock();
        let finished = core.success_count + core.failure_count;
        AgentStatus {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            rank: self.inner.rank,
            state: core.state,
            uptime_ms: self.uptime_ms(),
            task_count: core.task_count,
            success_count: core.success_count,
            failure_count: core.failure_count,
            success_rate: if finished == 0 {
                1.0
            } else {
                core.success_count as f64 / finished as f64
            },
            active_tasks: core.running.len(),
            queued_tasks: core.overflow.len(),
            max_concurrent_tasks: self.inner.config.max_concurrent_tasks,
            inbox_len: core.inbox.len(),
            last_heartbeat: core.last_heartbeat,
            last_task_duration_ms: core.last_task_duration_ms,
        }
    }

    /// Stop the heartbeat, abandon in-flight work, flush state, and report a summary.
    ///
    /// Idempotent: later calls return the first summary.
    pub async fn terminate(&self) -> AgentSummary {
        let (summary, aborts, snapshot) = {
            let mut core = self.inner.core.lock();
            if let Some(summary) = &core.summary {
                return summary.clone();
            }
            core.state = AgentState::Terminated;
            let running: Vec<(Uuid, AbortHandle)> = core.running.drain().collect();
            let pending: Vec<Uuid> = core.overflow.drain(..).map(|t| t.id).collect();
            let mut abandoned: Vec<Uuid> = running.iter().map(|(id, _)| *id).collect();
            abandoned.sort();
            let summary = AgentSummary {
                agent_id: self.inner.id.clone(),
                tasks_completed: core.success_count,
                tasks_failed: core.failure_count,
                total_tasks: core.task_count,
                uptime_ms: self.uptime_ms(),
                abandoned_tasks: abandoned,
                pending_tasks: pending,
            };
            core.summary = Some(summary.clone());
            let snapshot = self.snapshot_locked(&core);
            let aborts: Vec<AbortHandle> = running.into_iter().map(|(_, h)| h).collect();
            (summary, aborts, snapshot)
        };

        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }
        for handle in aborts {
            handle.abort();
        }

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.save_state(&self.inner.id, &snapshot).await {
                warn!(agent_id = %self.inner.id, error = %e, "Failed to flush agent state");
            }
        }

        info!(
            agent_id = %self.inner.id,
            tasks_completed = summary.tasks_completed,
            total_tasks = summary.total_tasks,
            uptime_ms = summary.uptime_ms,
            "Agent terminated"
        );
        self.inner.signals.emit(Signal::AgentTerminated {
            agent_id: self.inner.id.clone(),
            tasks_completed: summary.tasks_completed,
            total_tasks: summary.total_tasks,
            uptime_ms: summary.uptime_ms,
        });
        summary
    }

    /// Current persisted-state view of this agent.
    pub fn snapshot(&self) -> AgentSnapshot {
        let core = self.inner.core.lock();
        self.snapshot_locked(&core)
    }

    fn snapshot_locked(&self, core: &AgentCore) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            task_count: core.task_count,
            success_count: core.success_count,
            failure_count: core.failure_count,
            messages_sent: core.messages_sent,
            messages_received: core.messages_received,
            saved_at: Utc::now(),
        }
    }

    fn uptime_ms(&self) -> u64 {
        self.inner.born.elapsed().as_millis() as u64
    }

    fn arm_heartbeat(&self) {
        let mut slot = self.inner.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<AgentInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.heartbeat_interval_ms.max(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let mut core = inner.core.lock();
                if core.state == AgentState::Terminated {
                    break;
                }
                core.last_heartbeat = Utc::now();
            }
        }));
    }

    fn drain_overflow(&self, core: &mut AgentCore) {
        while core.state.accepts_work()
            && core.running.len() < self.inner.config.max_concurrent_tasks
        {
            let Some(task) = core.overflow.pop_front() else {
                break;
            };
            self.launch(core, task);
        }
    }

    // Must be called with the core lock held so the abort handle is
    // registered before the spawned task can report back.
    fn launch(&self, core: &mut AgentCore, mut task: Task) {
        task.status = TaskStatus::InProgress;
        task.assigned_agent = Some(self.inner.id.clone());
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        core.task_count += 1;
        core.state = AgentState::Executing;

        let task_id = task.id;
        let agent = self.clone();
        let handle = tokio::spawn(async move { agent.run_task(task).await });
        core.running.insert(task_id, handle.abort_handle());
        debug!(agent_id = %self.inner.id, task_id = %task_id, "Task started");
    }

    async fn run_task(self, task: Task) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.inner.handler.handle(&self.inner.id, &task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ColonyError::Execution("task handler panicked".into())));
        let duration_ms = started.elapsed().as_millis() as u64;
        self.finish_task(task, outcome, duration_ms);
    }

    fn finish_task(
        &self,
        mut task: Task,
        outcome: ColonyResult<serde_json::Value>,
        duration_ms: u64,
    ) {
        let error = {
            let mut core = self.inner.core.lock();
            if core.running.remove(&task.id).is_none() {
                debug!(agent_id = %self.inner.id, task_id = %task.id, "Dropping result of abandoned task");
                return;
            }
            core.last_task_duration_ms = Some(duration_ms);
            let error = match outcome {
                Ok(value) => {
                    core.success_count += 1;
                    task.status = TaskStatus::Completed;
                    task.result = Some(value);
                    task.completed_at = Some(Utc::now());
                    None
                }
                Err(e) => {
                    core.failure_count += 1;
                    task.status = TaskStatus::Failed;
                    let msg = e.to_string();
                    task.error = Some(msg.clone());
                    Some(msg)
                }
            };
            self.drain_overflow(&mut core);
            if core.running.is_empty() && core.state == AgentState::Executing {
                core.state = AgentState::Ready;
            }
            error
        };

        if let Some(error) = error {
            warn!(agent_id = %self.inner.id, task_id = %task.id, error = %error, "Task failed");
            self.inner.signals.emit(Signal::TaskError {
                task_id: task.id,
                agent_id: self.inner.id.clone(),
                error,
            });
        }

        if let Some(tx) = &self.inner.completions {
            let _ = tx.send(TaskCompletion {
                agent_id: self.inner.id.clone(),
                task,
                duration_ms,
            });
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl MessageRecipient for Agent {
    fn recipient_id(&self) -> &str {
        &self.inner.id
    }

    async fn deliver(&self, envelope: &MessageEnvelope) -> ColonyResult<()> {
        self.receive_message(envelope.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use crate::store::InMemoryStateStore;
    use colony_core::TaskOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Blocks every task until the test releases a permit, tracking peak concurrency.
    struct GateHandler {
        gate: Arc<Semaphore>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GateHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for GateHandler {
        async fn handle(&self, _agent_id: &str, task: &Task) -> ColonyResult<serde_json::Value> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::json!(task.name))
        }
    }

    fn task(name: &str) -> Task {
        Task::new(name, serde_json::Value::Null, TaskOptions::new(), 0, 60_000)
    }

    fn config(max: usize) -> AgentConfig {
        AgentConfig {
            max_concurrent_tasks: max,
            heartbeat_interval_ms: 10,
            inbox_capacity: 2,
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<TaskCompletion>) -> TaskCompletion {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("completion timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_start_and_terminate() {
        let agent = Agent::builder("agent-0001", Arc::new(crate::EchoHandler))
            .with_config(config(1))
            .build();
        assert_eq!(agent.state(), AgentState::Initializing);

        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Ready);
        assert!(agent.is_healthy());

        let first = agent.terminate().await;
        let second = agent.terminate().await;
        assert_eq!(first.uptime_ms, second.uptime_ms);
        assert_eq!(agent.state(), AgentState::Terminated);
        assert!(!agent.is_healthy());
        assert!(matches!(
            agent.execute(task("late")),
            Err(ColonyError::Shutdown(_))
        ));
        assert!(agent.start().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_overflow() {
        let handler = GateHandler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = Agent::builder("agent-0001", handler.clone())
            .with_config(config(2))
            .with_completion_sink(tx)
            .build();
        agent.start().await.unwrap();

        let mut outcomes = Vec::new();
        for i in 0..5 {
            outcomes.push(agent.execute(task(&format!("t{i}"))).unwrap());
        }
        assert_eq!(outcomes[0], ExecuteOutcome::Started);
        assert_eq!(outcomes[1], ExecuteOutcome::Started);
        assert_eq!(outcomes[2], ExecuteOutcome::Queued { position: 1 });
        assert_eq!(outcomes[4], ExecuteOutcome::Queued { position: 3 });
        assert_eq!(agent.active_count(), 2);
        assert_eq!(agent.queued_count(), 3);
        assert_eq!(agent.state(), AgentState::Executing);

        handler.gate.add_permits(5);
        let mut names = Vec::new();
        for _ in 0..5 {
            let done = recv(&mut rx).await;
            assert!(done.succeeded());
            names.push(done.task.name);
        }
        assert_eq!(names.len(), 5);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(agent.active_count(), 0);
        assert_eq!(agent.state(), AgentState::Ready);

        let status = agent.get_status();
        assert_eq!(status.task_count, 5);
        assert_eq!(status.success_count, 5);
        assert!((status.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let signals = SignalBus::new();
        let mut sig_rx = signals.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(FnHandler::new(|_t: Task| async {
            Err::<serde_json::Value, _>(ColonyError::Execution("disk full".into()))
        }));
        let agent = Agent::builder("agent-0001", handler)
            .with_config(config(1))
            .with_signals(signals)
            .with_completion_sink(tx)
            .build();
        agent.start().await.unwrap();

        agent.execute(task("write")).unwrap();
        let done = recv(&mut rx).await;
        assert!(!done.succeeded());
        assert_eq!(done.task.status, TaskStatus::Failed);
        assert!(done.task.error.unwrap().contains("disk full"));

        let sig = sig_rx.recv().await.unwrap();
        assert_eq!(sig.name(), "task_error");
        assert_eq!(agent.state(), AgentState::Ready);
        assert_eq!(agent.get_status().failure_count, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(FnHandler::new(|t: Task| async move {
            if t.name == "explode" {
                panic!("boom");
            }
            Ok::<_, ColonyError>(serde_json::Value::Null)
        }));
        let agent = Agent::builder("agent-0001", handler)
            .with_config(config(1))
            .with_completion_sink(tx)
            .build();
        agent.start().await.unwrap();

        agent.execute(task("explode")).unwrap();
        let done = recv(&mut rx).await;
        assert!(done.task.error.unwrap().contains("panicked"));

        agent.execute(task("fine")).unwrap();
        assert!(recv(&mut rx).await.succeeded());
    }

    #[tokio::test]
    async fn test_cancel_only_affects_unstarted_tasks() {
        let handler = GateHandler::new();
        let agent = Agent::builder("agent-0001", handler.clone())
            .with_config(config(1))
            .build();
        agent.start().await.unwrap();

        let running = task("running");
        let waiting = task("waiting");
        let (running_id, waiting_id) = (running.id, waiting.id);
        agent.execute(running).unwrap();
        agent.execute(waiting).unwrap();

        assert!(!agent.cancel_task(running_id));
        assert!(agent.cancel_task(waiting_id));
        assert!(!agent.cancel_task(waiting_id));
        assert_eq!(agent.queued_count(), 0);
        handler.gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_duplicate_assignment_rejected() {
        let handler = GateHandler::new();
        let agent = Agent::builder("agent-0001", handler.clone())
            .with_config(config(1))
            .build();
        agent.start().await.unwrap();
        let t = task("once");
        agent.execute(t.clone()).unwrap();
        assert!(matches!(agent.execute(t), Err(ColonyError::Validation(_))));
        handler.gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_pause_buffers_and_resume_drains() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = Agent::builder("agent-0001", Arc::new(crate::EchoHandler))
            .with_config(config(2))
            .with_completion_sink(tx)
            .build();
        agent.start().await.unwrap();

        assert!(agent.pause());
        assert_eq!(
            agent.execute(task("held")).unwrap(),
            ExecuteOutcome::Queued { position: 1 }
        );
        assert_eq!(agent.active_count(), 0);
        assert!(!agent.has_idle_capacity());

        assert!(agent.resume());
        assert!(recv(&mut rx).await.succeeded());
        assert!(!agent.resume());
    }

    #[tokio::test]
    async fn test_inbox_capacity() {
        let agent = Agent::builder("agent-0002", Arc::new(crate::EchoHandler))
            .with_config(config(1))
            .build();
        agent.start().await.unwrap();

        let env = MessageEnvelope::new("agent-0001", "agent-0002", serde_json::json!(1));
        agent.receive_message(env.clone()).unwrap();
        agent.deliver(&env).await.unwrap();
        let err = agent.receive_message(env).unwrap_err();
        assert!(err.is_retryable());

        assert_eq!(agent.take_messages().len(), 2);
        assert_eq!(agent.get_status().inbox_len, 0);
    }

    #[tokio::test]
    async fn test_send_message_builds_envelope() {
        let agent = Agent::builder("agent-0001", Arc::new(crate::EchoHandler)).build();
        let env = agent.send_message("agent-0002", serde_json::json!({"hello": true}));
        assert_eq!(env.from_agent_id, "agent-0001");
        assert_eq!(env.to_agent_id.as_deref(), Some("agent-0002"));
        assert_eq!(agent.snapshot().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_state_is_flushed_and_restored() {
        let store = Arc::new(InMemoryStateStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = Agent::builder("agent-0007", Arc::new(crate::EchoHandler))
            .with_store(store.clone())
            .with_completion_sink(tx)
            .build();
        agent.start().await.unwrap();
        agent.execute(task("a")).unwrap();
        recv(&mut rx).await;
        agent.terminate().await;

        let reborn = Agent::builder("agent-0007", Arc::new(crate::EchoHandler))
            .with_store(store)
            .build();
        reborn.start().await.unwrap();
        let status = reborn.get_status();
        assert_eq!(status.task_count, 1);
        assert_eq!(status.success_count, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_advances() {
        let agent = Agent::builder("agent-0001", Arc::new(crate::EchoHandler))
            .with_config(config(1))
            .build();
        agent.start().await.unwrap();
        let before = agent.get_status().last_heartbeat;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(agent.get_status().last_heartbeat > before);
        agent.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_reports_abandoned_work() {
        let handler = GateHandler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = Agent::builder("agent-0001", handler.clone())
            .with_config(config(1))
            .with_completion_sink(tx)
            .build();
        agent.start().await.unwrap();
        let running = task("running");
        let waiting = task("waiting");
        let (running_id, waiting_id) = (running.id, waiting.id);
        agent.execute(running).unwrap();
        agent.execute(waiting).unwrap();

        let summary = agent.terminate().await;
        assert_eq!(summary.abandoned_tasks, vec![running_id]);
        assert_eq!(summary.pending_tasks, vec![waiting_id]);

        handler.gate.add_permits(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
