use serde::{Deserialize, Serialize};

/// Per-agent execution limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tasks an agent runs at once; the rest wait in its overflow queue.
    pub max_concurrent_tasks: usize,
    pub heartbeat_interval_ms: u64,
    /// Maximum undelivered messages held in the inbox.
    pub inbox_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            heartbeat_interval_ms: 5000,
            inbox_capacity: 1000,
        }
    }
}

impl AgentConfig {
    /// An agent is considered unhealthy after missing this many heartbeats.
    pub const MISSED_HEARTBEATS: u32 = 3;

    pub fn heartbeat_grace_ms(&self) -> u64 {
        self.heartbeat_interval_ms
            .saturating_mul(u64::from(Self::MISSED_HEARTBEATS))
    }
}
