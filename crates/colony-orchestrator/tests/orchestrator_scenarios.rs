#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use colony_agent::{EchoHandler, TaskHandler};
use colony_core::{ColonyError, ColonyResult, Priority, Signal, SpawnReason, Task, TaskOptions, TaskStatus};
use colony_orchestrator::{HealthStatus, Orchestrator, SwarmConfig};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn config(min: usize, max: usize) -> SwarmConfig {
    let mut config = SwarmConfig {
        min_agents: min,
        max_agents: max,
        ..SwarmConfig::default()
    };
    config.scaling.enabled = false;
    config.metrics.enabled = false;
    config
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Blocks every task until released.
struct GateHandler {
    gate: Notify,
    started: AtomicUsize,
}

impl GateHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Notify::new(),
            started: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TaskHandler for GateHandler {
    async fn handle(&self, _agent_id: &str, _task: &Task) -> ColonyResult<serde_json::Value> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(json!("released"))
    }
}

struct FailingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn handle(&self, _agent_id: &str, _task: &Task) -> ColonyResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ColonyError::Execution("always fails".into()))
    }
}

struct RecordingHandler {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, _agent_id: &str, task: &Task) -> ColonyResult<serde_json::Value> {
        self.order.lock().push(task.name.clone());
        Ok(serde_json::Value::Null)
    }
}

/// The first call outlives its timeout and then fails; later calls succeed.
struct SlowThenFlakyHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for SlowThenFlakyHandler {
    async fn handle(&self, _agent_id: &str, _task: &Task) -> ColonyResult<serde_json::Value> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(130)).await;
            Err(ColonyError::Execution("gave up late".into()))
        } else {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(json!("second time lucky"))
        }
    }
}

/// The first call never returns; later calls succeed at once.
struct HangThenSucceedHandler {
    calls: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl TaskHandler for HangThenSucceedHandler {
    async fn handle(&self, _agent_id: &str, _task: &Task) -> ColonyResult<serde_json::Value> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.release.notified().await;
        }
        Ok(json!("done"))
    }
}

#[tokio::test]
async fn late_failure_from_timed_out_attempt_does_not_sink_the_retry() {
    let mut config = config(2, 2);
    config.queue.sweep_interval_ms = 10;
    config.scaling.check_interval_ms = 10;
    let handler = Arc::new(SlowThenFlakyHandler {
        calls: AtomicUsize::new(0),
    });
    let orch = Orchestrator::new(config, handler.clone()).unwrap();
    let mut signals = orch.signals().subscribe();
    orch.start().await.unwrap();

    let receipt = orch
        .submit_task(
            "slow",
            json!(null),
            TaskOptions::new().with_timeout_ms(100).with_max_retries(1),
        )
        .unwrap();
    assert!(
        wait_until(|| orch
            .queue()
            .get_task(receipt.task_id)
            .is_some_and(|t| t.status == TaskStatus::Completed))
        .await
    );

    let task = orch.queue().get_task(receipt.task_id).unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.assigned_agent.as_deref(), Some("agent-0002"));
    assert!(orch.queue().dead_letter_queue().is_empty());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    let metrics = orch.get_metrics();
    assert_eq!(metrics.tasks_completed, 1);
    assert_eq!(metrics.tasks_failed, 0);

    let mut failures = 0;
    while let Ok(signal) = signals.try_recv() {
        match signal {
            Signal::TaskFailed { will_retry, .. } => {
                assert!(will_retry);
                failures += 1;
            }
            Signal::TaskDeadLettered { .. } => panic!("retried task was dead-lettered"),
            _ => {}
        }
    }
    assert_eq!(failures, 1);
    orch.stop().await;
}

#[tokio::test]
async fn timed_out_task_is_redispatched_without_waiting_for_maintenance() {
    let mut config = config(2, 2);
    config.queue.sweep_interval_ms = 10;
    config.scaling.check_interval_ms = 60_000;
    let handler = Arc::new(HangThenSucceedHandler {
        calls: AtomicUsize::new(0),
        release: Notify::new(),
    });
    let orch = Orchestrator::new(config, handler.clone()).unwrap();
    orch.start().await.unwrap();

    let receipt = orch
        .submit_task(
            "hangs",
            json!(null),
            TaskOptions::new().with_timeout_ms(50).with_max_retries(1),
        )
        .unwrap();
    assert!(
        wait_until(|| orch
            .queue()
            .get_task(receipt.task_id)
            .is_some_and(|t| t.status == TaskStatus::Completed))
        .await
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(orch.queue().get_task(receipt.task_id).unwrap().retry_count, 1);

    handler.release.notify_waiters();
    orch.stop().await;
}

#[tokio::test]
async fn failing_task_is_retried_then_dead_lettered_once() {
    let handler = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    let orch = Orchestrator::new(config(1, 2), handler.clone()).unwrap();
    orch.start().await.unwrap();

    let receipt = orch
        .submit_task("doomed", json!({}), TaskOptions::new().with_max_retries(2))
        .unwrap();
    assert!(wait_until(|| orch.queue().dead_letter_queue().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let dlq = orch.queue().dead_letter_queue();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].task.id, receipt.task_id);
    assert_eq!(dlq[0].task.retry_count, 2);
    assert_eq!(orch.get_metrics().tasks_failed, 3);
    orch.stop().await;
}

#[tokio::test]
async fn sustained_backlog_triggers_scale_up() {
    let mut config = config(1, 4);
    config.scaling.enabled = true;
    config.scaling.check_interval_ms = 20;
    config.scaling.scale_up_queue_depth = 5;
    config.scaling.scale_up_sustain_checks = 2;
    config.scaling.scale_up_step = 2;
    let handler = GateHandler::new();
    let orch = Orchestrator::new(config, handler.clone()).unwrap();
    let mut signals = orch.signals().subscribe();
    orch.start().await.unwrap();

    for i in 0..30 {
        orch.submit_task(format!("job-{i}"), json!(i), TaskOptions::new())
            .unwrap();
    }
    assert!(wait_until(|| orch.swarm().len() == 4).await);

    let mut scale_ups = 0;
    while let Ok(signal) = signals.try_recv() {
        if let Signal::AgentSpawned {
            reason: SpawnReason::ScaleUp,
            ..
        } = signal
        {
            scale_ups += 1;
        }
    }
    assert_eq!(scale_ups, 3);
    // Every new agent was filled from the backlog.
    assert!(wait_until(|| handler.started.load(Ordering::SeqCst) == 12).await);
    orch.stop().await;
}

#[tokio::test]
async fn idle_swarm_scales_back_to_minimum() {
    let mut config = config(1, 4);
    config.scaling.enabled = true;
    config.scaling.check_interval_ms = 20;
    config.scaling.scale_down_sustain_checks = 2;
    let orch = Orchestrator::new(config, Arc::new(EchoHandler)).unwrap();
    orch.start().await.unwrap();

    let scaled = orch.scale_to_agent_count(4).await.unwrap();
    assert_eq!(scaled.current, 4);
    assert!(orch.send_message("agent-0001", "agent-0004", json!("hi")).await.success);
    assert!(orch.router().get_agent_statistics("agent-0004").is_some());
    assert!(wait_until(|| orch.swarm().len() == 1).await);
    // The oldest agent survives.
    assert_eq!(orch.swarm().ids(), vec!["agent-0001".to_string()]);
    assert_eq!(orch.get_metrics().agents_retired, 3);
    // Retired agents leave no per-agent delivery stats behind.
    assert!(orch.router().get_agent_statistics("agent-0004").is_none());
    assert!(orch.router().get_agent_statistics("agent-0001").is_some());
    orch.stop().await;
}

#[tokio::test]
async fn failed_agent_is_replaced_and_its_work_requeued() {
    let handler = GateHandler::new();
    let orch = Orchestrator::new(config(1, 2), handler.clone()).unwrap();
    orch.start().await.unwrap();
    let receipt = orch.submit_task("stuck", json!(null), TaskOptions::new()).unwrap();
    assert!(wait_until(|| handler.started.load(Ordering::SeqCst) == 1).await);

    let replacement = orch.report_agent_failure("agent-0001").await.unwrap();
    assert_eq!(replacement, "agent-0002");
    assert_eq!(orch.swarm().ids(), vec!["agent-0002".to_string()]);

    assert!(
        wait_until(|| {
            orch.queue().get_task(receipt.task_id).is_some_and(|t| {
                t.status == TaskStatus::InProgress
                    && t.assigned_agent.as_deref() == Some("agent-0002")
            })
        })
        .await
    );
    let task = orch.queue().get_task(receipt.task_id).unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(orch.get_metrics().agents_replaced, 1);
    orch.stop().await;
}

#[tokio::test]
async fn tasks_spread_across_least_busy_agents() {
    let handler = GateHandler::new();
    let orch = Orchestrator::new(config(3, 3), handler.clone()).unwrap();
    orch.start().await.unwrap();
    for i in 0..3 {
        orch.submit_task(format!("t{i}"), json!(i), TaskOptions::new())
            .unwrap();
    }
    let loads = orch.get_agent_loads();
    assert_eq!(loads.len(), 3);
    assert!(loads.iter().all(|l| l.active_tasks == 1));

    orch.submit_task("t3", json!(3), TaskOptions::new()).unwrap();
    let loads = orch.get_agent_loads();
    assert_eq!(loads[0].agent_id, "agent-0001");
    assert_eq!(loads[0].active_tasks, 2);
    orch.stop().await;
}

#[tokio::test]
async fn queued_tasks_run_in_priority_order() {
    let mut config = config(1, 1);
    config.agent.max_concurrent_tasks = 1;
    let handler = Arc::new(RecordingHandler {
        order: Mutex::new(Vec::new()),
    });
    let orch = Orchestrator::new(config, handler.clone()).unwrap();
    orch.submit_task("low", json!(null), TaskOptions::new().with_priority(Priority::Low))
        .unwrap();
    orch.submit_task("normal", json!(null), TaskOptions::new())
        .unwrap();
    orch.submit_task("high", json!(null), TaskOptions::new().with_priority(Priority::High))
        .unwrap();

    orch.start().await.unwrap();
    assert!(wait_until(|| handler.order.lock().len() == 3).await);
    assert_eq!(*handler.order.lock(), vec!["high", "normal", "low"]);
    orch.stop().await;
}

#[tokio::test]
async fn lifecycle_signals_are_mirrored_on_the_event_bus() {
    let orch = Orchestrator::new(config(2, 2), Arc::new(EchoHandler)).unwrap();
    orch.start().await.unwrap();
    orch.submit_task("echo", json!({"x": 1}), TaskOptions::new())
        .unwrap();
    assert!(wait_until(|| orch.get_metrics().tasks_completed == 1).await);
    orch.stop().await;

    let topics: Vec<String> = orch
        .events()
        .get_event_history(None)
        .into_iter()
        .map(|e| e.topic)
        .collect();
    for expected in [
        "swarm.agent_spawned",
        "swarm.swarm_started",
        "swarm.task_distributed",
        "swarm.task_completed",
        "swarm.agent_terminated",
        "swarm.swarm_stopped",
    ] {
        assert!(topics.iter().any(|t| t == expected), "missing {expected}");
    }
    let spawned = orch.events().get_event_history(Some("swarm.agent_spawned"));
    assert_eq!(spawned.len(), 2);
    assert_eq!(spawned[0].payload["reason"], "startup");
    assert_eq!(spawned[0].source.as_deref(), Some("orchestrator"));
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let orch = Orchestrator::new(config(2, 3), Arc::new(EchoHandler)).unwrap();
    let mut signals = orch.signals().subscribe();
    orch.start().await.unwrap();
    orch.stop().await;
    orch.stop().await;

    let mut stopped = 0;
    let mut after_stop = 0;
    while let Ok(signal) = signals.try_recv() {
        if stopped > 0 {
            after_stop += 1;
        }
        if signal == Signal::SwarmStopped {
            stopped += 1;
        }
    }
    assert_eq!(stopped, 1);
    assert_eq!(after_stop, 0);
    assert!(!orch.is_running());
    assert!(orch.swarm().is_empty());
    assert!(orch.submit_task("late", json!(null), TaskOptions::new()).is_err());
}

#[tokio::test]
async fn healthy_swarm_reports_full_health() {
    let orch = Orchestrator::new(config(3, 5), Arc::new(EchoHandler)).unwrap();
    orch.start().await.unwrap();
    let health = orch.get_swarm_health();
    assert_eq!(health.total_agents, 3);
    assert_eq!(health.healthy_agents, 3);
    assert_eq!(health.health_percentage, 100.0);
    assert_eq!(health.status, HealthStatus::Healthy);

    let status = orch.get_swarm_status();
    assert!(status.running);
    assert_eq!(status.agents.len(), 3);
    orch.stop().await;

    assert_eq!(orch.get_swarm_health().status, HealthStatus::Critical);
}

#[tokio::test]
async fn agents_exchange_messages_through_the_router() {
    let orch = Orchestrator::new(config(3, 3), Arc::new(EchoHandler)).unwrap();
    orch.start().await.unwrap();

    let sent = orch
        .send_message("agent-0001", "agent-0002", json!({"ping": 1}))
        .await;
    assert!(sent.success);
    let inbox = orch.swarm().get("agent-0002").unwrap().take_messages();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].from_agent_id, "agent-0001");

    let missing = orch.send_message("agent-0001", "agent-0404", json!(null)).await;
    assert!(!missing.success);

    let broadcast = orch.broadcast_message("agent-0001", json!("hello")).await;
    assert_eq!(broadcast.recipients, 2);
    assert_eq!(broadcast.delivered_count, 2);
    assert!(orch.swarm().get("agent-0001").unwrap().take_messages().is_empty());
    orch.stop().await;
}
