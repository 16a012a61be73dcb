use crate::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle signals emitted by swarm components.
///
/// Any external observer can follow them through a [`SignalBus`] receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    SwarmStarted {
        agent_count: usize,
    },
    SwarmStopped,
    AgentSpawned {
        agent_id: String,
        reason: SpawnReason,
    },
    AgentRetired {
        agent_id: String,
    },
    AgentReplaced {
        failed_agent_id: String,
        replacement_agent_id: String,
    },
    AgentTerminated {
        agent_id: String,
        tasks_completed: u64,
        total_tasks: u64,
        uptime_ms: u64,
    },
    TaskDistributed {
        task_id: Uuid,
        agent_id: String,
    },
    TaskCompleted {
        task_id: Uuid,
        agent_id: Option<String>,
        latency_ms: u64,
    },
    TaskFailed {
        task_id: Uuid,
        error: String,
        retry_count: u32,
        will_retry: bool,
    },
    TaskDeadLettered {
        task_id: Uuid,
        reason: String,
    },
    /// A task handler failed on an agent. The agent keeps running.
    TaskError {
        task_id: Uuid,
        agent_id: String,
        error: String,
    },
    MessageSent {
        message_id: Uuid,
        from: String,
        to: String,
        attempts: u32,
    },
    MessageFailed {
        message_id: Uuid,
        from: String,
        to: Option<String>,
        error_type: ErrorKind,
        error: String,
    },
    MessageRetrying {
        message_id: Uuid,
        to: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    SubscriptionError {
        topic: String,
        subscription_id: u64,
        event_id: Uuid,
        error: String,
    },
    AnomalyDetected {
        metric: String,
        value: f64,
        mean: f64,
        std_dev: f64,
    },
}

/// Why an agent was spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnReason {
    Startup,
    ScaleUp,
    Manual,
    Replacement,
}

impl Signal {
    /// The snake_case name of this signal (e.g. `agent_spawned`).
    pub fn name(&self) -> &'static str {
        match self {
            Signal::SwarmStarted { .. } => "swarm_started",
            Signal::SwarmStopped => "swarm_stopped",
            Signal::AgentSpawned { .. } => "agent_spawned",
            Signal::AgentRetired { .. } => "agent_retired",
            Signal::AgentReplaced { .. } => "agent_replaced",
            Signal::AgentTerminated { .. } => "agent_terminated",
            Signal::TaskDistributed { .. } => "task_distributed",
            Signal::TaskCompleted { .. } => "task_completed",
            Signal::TaskFailed { .. } => "task_failed",
            Signal::TaskDeadLettered { .. } => "task_dead_lettered",
            Signal::TaskError { .. } => "task_error",
            Signal::MessageSent { .. } => "message_sent",
            Signal::MessageFailed { .. } => "message_failed",
            Signal::MessageRetrying { .. } => "message_retrying",
            Signal::SubscriptionError { .. } => "subscription_error",
            Signal::AnomalyDetected { .. } => "anomaly_detected",
        }
    }
}

const DEFAULT_SIGNAL_CAPACITY: usize = 4096;

/// Cloneable fan-out stream of [`Signal`]s.
///
/// Emitting never blocks and never fails: with no receivers the signal is
/// dropped, and slow receivers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIGNAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit a signal to every current receiver.
    pub fn emit(&self, signal: Signal) {
        tracing::trace!(signal = signal.name(), "emit");
        let _ = self.tx.send(signal);
    }

    /// Start receiving signals emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_receivers() {
        let bus = SignalBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(Signal::AgentRetired {
            agent_id: "agent-0002".into(),
        });

        assert_eq!(a.recv().await.unwrap().name(), "agent_retired");
        assert_eq!(b.recv().await.unwrap().name(), "agent_retired");
    }

    #[test]
    fn test_emit_without_receivers_is_silent() {
        let bus = SignalBus::new();
        bus.emit(Signal::SwarmStopped);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_signal_serialization_tag() {
        let sig = Signal::AgentReplaced {
            failed_agent_id: "agent-0001".into(),
            replacement_agent_id: "agent-0004".into(),
        };
        let json = serde_json::to_value(&sig).unwrap();
        assert_eq!(json["signal"], "agent_replaced");
        assert_eq!(json["replacement_agent_id"], "agent-0004");
    }
}
