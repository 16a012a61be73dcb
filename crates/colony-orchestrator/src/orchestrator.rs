use crate::config::SwarmConfig;
use crate::metrics::MetricsCollector;
use crate::task_queue::{Attempt, EnqueueReceipt, TaskQueue};
use crate::types::{AgentLoad, HealthStatus, ScaleResult, SwarmHealth, SwarmMetrics, SwarmStatus};
use colony_agent::{
    Agent, AgentState, AgentStatus, EchoHandler, StateStore, SwarmState, TaskCompletion,
    TaskHandler,
};
use colony_core::{
    ColonyError, ColonyResult, Metadata, MessageEnvelope, Signal, SignalBus, SpawnReason,
    TaskOptions,
};
use colony_events::EventBus;
use colony_router::{BroadcastResult, MessageRouter, SendResult};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of the event-bus topics that mirror lifecycle signals (`swarm.task_completed`, ...).
pub const SIGNAL_TOPIC_PREFIX: &str = "swarm.";

/// Source recorded on events republished from the signal stream.
const SIGNAL_EVENT_SOURCE: &str = "orchestrator";

const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    distributed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    spawned: AtomicU64,
    retired: AtomicU64,
    replaced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Consecutive scaling checks that saw pressure in one direction.
#[derive(Default)]
struct ScalingStreaks {
    high: u32,
    low: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum ScalingDecision {
    Up(usize),
    Down(usize),
    Hold,
}

#[derive(Default)]
struct Lifecycle {
    started_at: Option<Instant>,
    background: Vec<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

struct OrchestratorInner {
    config: SwarmConfig,
    handler: Arc<dyn TaskHandler>,
    store: Option<Arc<dyn StateStore>>,
    swarm: Arc<SwarmState>,
    queue: TaskQueue,
    router: MessageRouter,
    events: EventBus,
    signals: SignalBus,
    metrics: MetricsCollector,
    completion_tx: mpsc::UnboundedSender<TaskCompletion>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskCompletion>>>,
    lifecycle: Mutex<Lifecycle>,
    /// Serializes spawning and retiring agents.
    membership: tokio::sync::Mutex<()>,
    /// Serializes assignment so an agent is never handed more work than it has slots for.
    dispatch: Mutex<()>,
    streaks: Mutex<ScalingStreaks>,
    counters: Counters,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: SwarmConfig,
    handler: Option<Arc<dyn TaskHandler>>,
    store: Option<Arc<dyn StateStore>>,
    signals: Option<SignalBus>,
}

impl OrchestratorBuilder {
    /// Handler every agent runs tasks with. Defaults to [`EchoHandler`].
    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Persist agent state through `store`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing signal bus instead of creating one.
    pub fn with_signals(mut self, signals: SignalBus) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Validate the configuration and wire the components together.
    pub fn build(self) -> ColonyResult<Orchestrator> {
        self.config.validate()?;
        let config = self.config;
        let signals = self.signals.unwrap_or_default();
        let swarm = Arc::new(SwarmState::new());
        let queue = TaskQueue::new(config.queue.clone(), signals.clone());
        let router = MessageRouter::new(config.router.clone(), swarm.clone(), signals.clone());
        let events = EventBus::new(config.events.clone(), signals.clone());
        let metrics = MetricsCollector::new(
            config.metrics.clone(),
            swarm.clone(),
            queue.clone(),
            signals.clone(),
        );
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        Ok(Orchestrator {
            inner: Arc::new(OrchestratorInner {
                handler: self.handler.unwrap_or_else(|| Arc::new(EchoHandler)),
                store: self.store,
                swarm,
                queue,
                router,
                events,
                signals,
                metrics,
                completion_tx,
                completion_rx: Mutex::new(Some(completion_rx)),
                lifecycle: Mutex::new(Lifecycle::default()),
                membership: tokio::sync::Mutex::new(()),
                dispatch: Mutex::new(()),
                streaks: Mutex::new(ScalingStreaks::default()),
                counters: Counters::default(),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                config,
            }),
        })
    }
}

/// Owns the swarm: spawns and retires agents, feeds them from the task queue,
/// scales with load, and replaces failed agents.
///
/// Cloning yields another handle to the same swarm.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn builder(config: SwarmConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            handler: None,
            store: None,
            signals: None,
        }
    }

    /// Orchestrator whose agents run tasks with `handler`.
    pub fn new(config: SwarmConfig, handler: Arc<dyn TaskHandler>) -> ColonyResult<Self> {
        Self::builder(config).with_handler(handler).build()
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    /// Event bus that also carries every lifecycle signal under `swarm.<signal>`.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn signals(&self) -> &SignalBus {
        &self.inner.signals
    }

    pub fn swarm(&self) -> &Arc<SwarmState> {
        &self.inner.swarm
    }

    pub fn metrics_collector(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn `min_agents` agents and start the background loops.
    ///
    /// Idempotent while running. Fails with `Shutdown` once stopped.
    pub async fn start(&self) -> ColonyResult<()> {
        self.ensure_not_stopped()?;
        let membership = self.inner.membership.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let forwarder = self.spawn_signal_forwarder();
        self.inner.lifecycle.lock().forwarder = Some(forwarder);

        for _ in 0..self.inner.config.min_agents {
            self.spawn_agent(SpawnReason::Startup).await?;
        }

        self.inner.running.store(true, Ordering::Release);
        self.inner.queue.start();
        self.inner.metrics.start();

        let mut background = Vec::new();
        if let Some(rx) = self.inner.completion_rx.lock().take() {
            background.push(self.spawn_completion_loop(rx));
        }
        background.push(self.spawn_maintenance_loop());
        background.push(self.spawn_requeue_loop());
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.background.extend(background);
            lifecycle.started_at = Some(Instant::now());
        }

        let agent_count = self.inner.swarm.len();
        info!(
            agents = agent_count,
            min_agents = self.inner.config.min_agents,
            max_agents = self.inner.config.max_agents,
            "Swarm started"
        );
        self.inner.signals.emit(Signal::SwarmStarted { agent_count });
        drop(membership);

        self.dispatch_pending();
        Ok(())
    }

    /// Enqueue a task and hand it to an idle agent right away when one exists.
    pub fn submit_task(
        &self,
        name: impl Into<String>,
        content: serde_json::Value,
        options: TaskOptions,
    ) -> ColonyResult<EnqueueReceipt> {
        self.ensure_not_stopped()?;
        let receipt = self.inner.queue.enqueue(name, content, options)?;
        Counters::bump(&self.inner.counters.submitted);
        self.dispatch_pending();
        Ok(receipt)
    }

    /// Cancel a queued task, or one an agent has accepted but not yet started.
    ///
    /// Running tasks cannot be cancelled.
    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        if self.inner.queue.cancel(task_id).is_some() {
            return true;
        }
        for agent in self.inner.swarm.agents() {
            if agent.cancel_task(task_id) {
                self.inner.queue.cancel_in_progress(task_id);
                return true;
            }
        }
        false
    }

    /// Assign queued tasks to the least-busy agents until either runs out.
    ///
    /// Returns the number of tasks handed out.
    pub fn dispatch_pending(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let _dispatch = self.inner.dispatch.lock();
        let mut dispatched = 0;
        while let Some(agent) = self.least_busy_agent() {
            let Some(task) = self.inner.queue.dequeue() else {
                break;
            };
            let task_id = task.id;
            if let Err(e) = self.inner.queue.mark_started(task_id, agent.id()) {
                warn!(task_id = %task_id, error = %e, "Dequeued task vanished before assignment");
                continue;
            }
            match agent.execute(task) {
                Ok(outcome) => {
                    dispatched += 1;
                    Counters::bump(&self.inner.counters.distributed);
                    debug!(
                        task_id = %task_id,
                        agent_id = %agent.id(),
                        outcome = ?outcome,
                        "Task distributed"
                    );
                    self.inner.signals.emit(Signal::TaskDistributed {
                        task_id,
                        agent_id: agent.id().to_string(),
                    });
                }
                Err(e) => {
                    warn!(task_id = %task_id, agent_id = %agent.id(), error = %e, "Agent refused task");
                    self.inner.queue.release(task_id);
                    break;
                }
            }
        }
        dispatched
    }

    fn least_busy_agent(&self) -> Option<Agent> {
        self.inner
            .swarm
            .agents()
            .into_iter()
            .filter(Agent::has_idle_capacity)
            .min_by(|a, b| a.load().cmp(&b.load()).then_with(|| a.id().cmp(b.id())))
    }

    fn on_task_finished(&self, done: TaskCompletion) {
        let task_id = done.task.id;
        // The agent's copy carries the retry count it was dispatched with.
        let attempt = Attempt::new(&done.agent_id, done.task.retry_count);
        let settled = if done.succeeded() {
            let result = done.task.result.clone().unwrap_or(serde_json::Value::Null);
            self.inner
                .queue
                .mark_completed(task_id, result, Some(attempt))
                .map(|_| &self.inner.counters.completed)
        } else {
            let error = done
                .task
                .error
                .clone()
                .unwrap_or_else(|| "task failed".to_string());
            self.inner
                .queue
                .mark_failed(task_id, &error, Some(attempt))
                .map(|_| &self.inner.counters.failed)
        };
        match settled {
            Ok(counter) => Counters::bump(counter),
            Err(e) => debug!(
                task_id = %task_id,
                agent_id = %done.agent_id,
                retry_count = done.task.retry_count,
                error = %e,
                "Ignoring stale result"
            ),
        }
        self.dispatch_pending();
    }

    /// Terminate a failed agent, requeue its work, and spawn a replacement.
    ///
    /// Tasks the agent was running count as failed attempts. Tasks it had
    /// accepted but not started go back to the front of the queue.
    pub async fn report_agent_failure(&self, agent_id: &str) -> ColonyResult<String> {
        self.ensure_running()?;
        let membership = self.inner.membership.lock().await;
        let replacement = self.replace_agent_locked(agent_id).await?;
        drop(membership);
        self.dispatch_pending();
        Ok(replacement)
    }

    async fn replace_agent_locked(&self, agent_id: &str) -> ColonyResult<String> {
        let agent = {
            let _dispatch = self.inner.dispatch.lock();
            self.inner.swarm.remove(agent_id)
        }
        .ok_or_else(|| ColonyError::NotFound(format!("agent '{agent_id}'")))?;
        warn!(agent_id, "Replacing failed agent");

        let summary = agent.terminate().await;
        for task_id in &summary.abandoned_tasks {
            let Some(task) = self.inner.queue.get_task(*task_id) else {
                continue;
            };
            let attempt = Attempt::new(agent_id, task.retry_count);
            if let Err(e) = self
                .inner
                .queue
                .mark_failed(*task_id, "agent failed", Some(attempt))
            {
                debug!(task_id = %task_id, error = %e, "Abandoned task already settled");
            }
        }
        for task_id in &summary.pending_tasks {
            self.inner.queue.release(*task_id);
        }
        self.inner.router.forget_agent(agent_id);

        let replacement = self.spawn_agent(SpawnReason::Replacement).await?;
        Counters::bump(&self.inner.counters.replaced);
        info!(
            failed_agent_id = agent_id,
            replacement_agent_id = %replacement,
            abandoned = summary.abandoned_tasks.len(),
            requeued = summary.pending_tasks.len(),
            "Agent replaced"
        );
        self.inner.signals.emit(Signal::AgentReplaced {
            failed_agent_id: agent_id.to_string(),
            replacement_agent_id: replacement.clone(),
        });
        Ok(replacement)
    }

    /// Spawn or retire agents toward `count`, clamped to `[min_agents, max_agents]`.
    ///
    /// Only idle agents are retired, so the swarm may stay above the target.
    pub async fn scale_to_agent_count(&self, count: usize) -> ColonyResult<ScaleResult> {
        self.ensure_running()?;
        let target = count.clamp(self.inner.config.min_agents, self.inner.config.max_agents);
        let membership = self.inner.membership.lock().await;
        let previous = self.inner.swarm.len();
        if target > previous {
            for _ in previous..target {
                self.spawn_agent(SpawnReason::Manual).await?;
            }
        } else if target < previous {
            self.retire_idle_locked(previous - target).await;
        }
        let current = self.inner.swarm.len();
        drop(membership);
        info!(requested = count, target, previous, current, "Swarm scaled");
        self.dispatch_pending();
        Ok(ScaleResult {
            requested: count,
            target,
            previous,
            current,
        })
    }

    async fn spawn_agent(&self, reason: SpawnReason) -> ColonyResult<String> {
        let id = self.inner.swarm.allocate_id();
        let rank = Counters::get(&self.inner.counters.spawned) as u32 + 1;
        let mut builder = Agent::builder(id.clone(), self.inner.handler.clone())
            .with_name(format!("worker {rank}"))
            .with_rank(rank)
            .with_config(self.inner.config.agent.clone())
            .with_signals(self.inner.signals.clone())
            .with_completion_sink(self.inner.completion_tx.clone());
        if let Some(store) = &self.inner.store {
            builder = builder.with_store(store.clone());
        }
        let agent = builder.build();
        agent.start().await?;
        self.inner.swarm.insert(agent);
        Counters::bump(&self.inner.counters.spawned);

        info!(agent_id = %id, reason = ?reason, "Agent spawned");
        self.inner.signals.emit(Signal::AgentSpawned {
            agent_id: id.clone(),
            reason,
        });
        Ok(id)
    }

    /// Retire up to `count` idle agents, newest first, never below `min_agents`.
    async fn retire_idle_locked(&self, count: usize) -> Vec<String> {
        let retired: Vec<Agent> = {
            let _dispatch = self.inner.dispatch.lock();
            let removable = self
                .inner
                .swarm
                .len()
                .saturating_sub(self.inner.config.min_agents);
            let mut idle: Vec<Agent> = self
                .inner
                .swarm
                .agents()
                .into_iter()
                .filter(|a| a.load() == 0)
                .collect();
            idle.reverse();
            idle.truncate(count.min(removable));
            for agent in &idle {
                self.inner.swarm.remove(agent.id());
            }
            idle
        };

        let mut ids = Vec::with_capacity(retired.len());
        for agent in retired {
            agent.terminate().await;
            self.inner.router.forget_agent(agent.id());
            Counters::bump(&self.inner.counters.retired);
            info!(agent_id = %agent.id(), "Agent retired");
            self.inner.signals.emit(Signal::AgentRetired {
                agent_id: agent.id().to_string(),
            });
            ids.push(agent.id().to_string());
        }
        ids
    }

    fn evaluate_scaling(&self) -> ScalingDecision {
        let scaling = &self.inner.config.scaling;
        let agents = self.inner.swarm.agents();
        let count = agents.len();
        let (active, slots) = agents.iter().fold((0usize, 0usize), |(active, slots), a| {
            (active + a.active_count(), slots + a.config().max_concurrent_tasks)
        });
        let utilization = if slots == 0 {
            0.0
        } else {
            active as f64 / slots as f64
        };
        let depth = self.inner.queue.len();

        let mut streaks = self.inner.streaks.lock();
        if depth > scaling.scale_up_queue_depth && count < self.inner.config.max_agents {
            streaks.low = 0;
            streaks.high += 1;
            if streaks.high >= scaling.scale_up_sustain_checks {
                streaks.high = 0;
                let room = self.inner.config.max_agents - count;
                return ScalingDecision::Up(scaling.scale_up_step.min(room));
            }
        } else if depth == 0
            && utilization < scaling.scale_down_utilization
            && count > self.inner.config.min_agents
        {
            streaks.high = 0;
            streaks.low += 1;
            if streaks.low >= scaling.scale_down_sustain_checks {
                streaks.low = 0;
                return ScalingDecision::Down(1);
            }
        } else {
            streaks.high = 0;
            streaks.low = 0;
        }
        ScalingDecision::Hold
    }

    /// One maintenance pass: replace unhealthy agents, apply the scaling
    /// decision, and feed idle agents.
    async fn run_maintenance(&self) {
        let unhealthy: Vec<String> = self
            .inner
            .swarm
            .agents()
            .iter()
            .filter(|a| a.state() != AgentState::Initializing && !a.is_healthy())
            .map(|a| a.id().to_string())
            .collect();
        for agent_id in unhealthy {
            let membership = self.inner.membership.lock().await;
            if let Err(e) = self.replace_agent_locked(&agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to replace unhealthy agent");
            }
            drop(membership);
        }

        if self.inner.config.scaling.enabled {
            match self.evaluate_scaling() {
                ScalingDecision::Up(n) => {
                    let membership = self.inner.membership.lock().await;
                    let room = self
                        .inner
                        .config
                        .max_agents
                        .saturating_sub(self.inner.swarm.len());
                    info!(adding = n.min(room), queue_depth = self.inner.queue.len(), "Scaling up");
                    for _ in 0..n.min(room) {
                        if let Err(e) = self.spawn_agent(SpawnReason::ScaleUp).await {
                            warn!(error = %e, "Scale-up spawn failed");
                            break;
                        }
                    }
                    drop(membership);
                }
                ScalingDecision::Down(n) => {
                    let membership = self.inner.membership.lock().await;
                    let retired = self.retire_idle_locked(n).await;
                    drop(membership);
                    debug!(retired = ?retired, "Scaled down");
                }
                ScalingDecision::Hold => {}
            }
        }

        self.dispatch_pending();
    }

    pub fn get_swarm_health(&self) -> SwarmHealth {
        let agents = self.inner.swarm.agents();
        let total_agents = agents.len();
        let healthy_agents = agents.iter().filter(|a| a.is_healthy()).count();
        let health_percentage = if total_agents == 0 {
            0.0
        } else {
            healthy_agents as f64 * 100.0 / total_agents as f64
        };
        SwarmHealth {
            total_agents,
            healthy_agents,
            health_percentage,
            status: HealthStatus::from_percentage(health_percentage),
        }
    }

    pub fn get_agent_list(&self) -> Vec<AgentStatus> {
        self.inner
            .swarm
            .agents()
            .iter()
            .map(Agent::get_status)
            .collect()
    }

    pub fn get_agent_loads(&self) -> Vec<AgentLoad> {
        self.inner
            .swarm
            .agents()
            .iter()
            .map(|a| {
                let max = a.config().max_concurrent_tasks;
                let active = a.active_count();
                AgentLoad {
                    agent_id: a.id().to_string(),
                    state: a.state(),
                    active_tasks: active,
                    queued_tasks: a.queued_count(),
                    max_concurrent_tasks: max,
                    utilization: if max == 0 { 0.0 } else { active as f64 / max as f64 },
                }
            })
            .collect()
    }

    pub fn get_swarm_status(&self) -> SwarmStatus {
        let uptime_ms = self
            .inner
            .lifecycle
            .lock()
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let agents = self.get_agent_list();
        SwarmStatus {
            running: self.is_running(),
            uptime_ms,
            agent_count: agents.len(),
            min_agents: self.inner.config.min_agents,
            max_agents: self.inner.config.max_agents,
            health: self.get_swarm_health(),
            queue: self.inner.queue.get_queue_statistics(),
            agents,
        }
    }

    pub fn get_metrics(&self) -> SwarmMetrics {
        let counters = &self.inner.counters;
        let loads = self.get_agent_loads();
        let active_tasks: usize = loads.iter().map(|l| l.active_tasks).sum();
        let slots: usize = loads.iter().map(|l| l.max_concurrent_tasks).sum();
        let queue = self.inner.queue.get_queue_statistics();
        SwarmMetrics {
            tasks_submitted: Counters::get(&counters.submitted),
            tasks_distributed: Counters::get(&counters.distributed),
            tasks_completed: Counters::get(&counters.completed),
            tasks_failed: Counters::get(&counters.failed),
            tasks_dead_lettered: queue.dead_lettered,
            agents_spawned: Counters::get(&counters.spawned),
            agents_retired: Counters::get(&counters.retired),
            agents_replaced: Counters::get(&counters.replaced),
            agent_count: loads.len(),
            queue_depth: queue.queued,
            active_tasks,
            utilization: if slots == 0 {
                0.0
            } else {
                active_tasks as f64 / slots as f64
            },
            router: self.inner.router.get_statistics(),
            events: self.inner.events.get_event_statistics(),
            latest_snapshot: self.inner.metrics.latest(),
        }
    }

    /// Route a message between agents. `from` need not be a swarm member.
    pub async fn send_message(
        &self,
        from: &str,
        to: &str,
        content: serde_json::Value,
    ) -> SendResult {
        let envelope = match self.inner.swarm.get(from) {
            Some(agent) => agent.send_message(to, content),
            None => MessageEnvelope::new(from, to, content),
        };
        self.inner.router.send_message(envelope).await
    }

    /// Deliver `content` to every agent except `from`.
    pub async fn broadcast_message(&self, from: &str, content: serde_json::Value) -> BroadcastResult {
        self.inner
            .router
            .broadcast_message(MessageEnvelope::broadcast(from, content))
            .await
    }

    /// Stop the loops, terminate every agent, and shut down the queue, router,
    /// and event bus. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_running = self.inner.running.swap(false, Ordering::AcqRel);
        let (background, forwarder) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            (
                std::mem::take(&mut lifecycle.background),
                lifecycle.forwarder.take(),
            )
        };
        for handle in background {
            handle.abort();
        }
        self.inner.metrics.stop();
        self.inner.queue.stop();
        self.inner.router.stop();

        let membership = self.inner.membership.lock().await;
        let agents = self.inner.swarm.drain();
        let summaries = join_all(agents.iter().map(|a| a.terminate())).await;
        drop(membership);
        let abandoned: usize = summaries
            .iter()
            .map(|s| s.abandoned_tasks.len() + s.pending_tasks.len())
            .sum();

        self.inner.signals.emit(Signal::SwarmStopped);
        if let Some(forwarder) = forwarder {
            let abort = forwarder.abort_handle();
            if tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, forwarder)
                .await
                .is_err()
            {
                debug!("Signal forwarder did not drain in time");
                abort.abort();
            }
        }
        self.inner.events.stop();

        info!(
            was_running,
            agents = summaries.len(),
            abandoned_tasks = abandoned,
            "Swarm stopped"
        );
    }

    fn ensure_not_stopped(&self) -> ColonyResult<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(ColonyError::Shutdown("orchestrator is stopped".into()));
        }
        Ok(())
    }

    fn ensure_running(&self) -> ColonyResult<()> {
        self.ensure_not_stopped()?;
        if !self.is_running() {
            return Err(ColonyError::Shutdown("orchestrator is not started".into()));
        }
        Ok(())
    }

    /// Republish every lifecycle signal on the event bus until the swarm stops.
    fn spawn_signal_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.inner.signals.subscribe();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        let last = matches!(signal, Signal::SwarmStopped);
                        // Republishing a subscriber failure could fail the same subscriber again.
                        if !matches!(signal, Signal::SubscriptionError { .. }) {
                            republish(&events, &signal);
                        }
                        if last {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Signal forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_completion_loop(
        &self,
        mut rx: mpsc::UnboundedReceiver<TaskCompletion>,
    ) -> JoinHandle<()> {
        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(done) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Orchestrator { inner }.on_task_finished(done);
            }
        })
    }

    /// Dispatch retries as soon as the queue puts them back, instead of
    /// waiting for the next maintenance tick.
    fn spawn_requeue_loop(&self) -> JoinHandle<()> {
        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        let queue = self.inner.queue.clone();
        tokio::spawn(async move {
            loop {
                queue.requeued().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let orchestrator = Orchestrator { inner };
                if !orchestrator.is_running() {
                    break;
                }
                orchestrator.dispatch_pending();
            }
        })
    }

    fn spawn_maintenance_loop(&self) -> JoinHandle<()> {
        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.scaling.check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let orchestrator = Orchestrator { inner };
                if !orchestrator.is_running() {
                    break;
                }
                orchestrator.run_maintenance().await;
            }
        })
    }
}

fn republish(events: &EventBus, signal: &Signal) {
    let topic = format!("{SIGNAL_TOPIC_PREFIX}{}", signal.name());
    let payload = match serde_json::to_value(signal) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Failed to encode signal");
            return;
        }
    };
    if let Err(e) = events.publish(&topic, payload, Metadata::new(), Some(SIGNAL_EVENT_SOURCE)) {
        debug!(topic = %topic, error = %e, "Signal not republished");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.inner.swarm.len())
            .field("queued", &self.inner.queue.len())
            .field("running", &self.is_running())
            .finish()
    }
}
