use crate::metrics::MetricsSnapshot;
use crate::task_queue::QueueStatistics;
use colony_agent::{AgentState, AgentStatus};
use colony_events::EventStatistics;
use colony_router::RouterStatistics;
use serde::{Deserialize, Serialize};

/// Coarse swarm health derived from the share of healthy agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// At least 80% of agents are healthy.
    Healthy,
    /// At least 50% of agents are healthy.
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn from_percentage(pct: f64) -> Self {
        if pct >= 80.0 {
            HealthStatus::Healthy
        } else if pct >= 50.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmHealth {
    pub total_agents: usize,
    pub healthy_agents: usize,
    /// 0 when the swarm has no agents.
    pub health_percentage: f64,
    pub status: HealthStatus,
}

/// Current load of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoad {
    pub agent_id: String,
    pub state: AgentState,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub max_concurrent_tasks: usize,
    /// Active tasks over the concurrency limit.
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub running: bool,
    pub uptime_ms: u64,
    pub agent_count: usize,
    pub min_agents: usize,
    pub max_agents: usize,
    pub health: SwarmHealth,
    pub queue: QueueStatistics,
    pub agents: Vec<AgentStatus>,
}

/// Running counters of the orchestrator plus the latest component statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMetrics {
    pub tasks_submitted: u64,
    pub tasks_distributed: u64,
    pub tasks_completed: u64,
    /// Failed attempts reported by agents, including retried ones.
    pub tasks_failed: u64,
    pub tasks_dead_lettered: u64,
    pub agents_spawned: u64,
    pub agents_retired: u64,
    pub agents_replaced: u64,
    pub agent_count: usize,
    pub queue_depth: usize,
    pub active_tasks: usize,
    pub utilization: f64,
    pub router: RouterStatistics,
    pub events: EventStatistics,
    pub latest_snapshot: Option<MetricsSnapshot>,
}

/// Outcome of [`crate::Orchestrator::scale_to_agent_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleResult {
    pub requested: usize,
    /// `requested` clamped to `[min_agents, max_agents]`.
    pub target: usize,
    pub previous: usize,
    /// May stay above `target` when busy agents could not be retired.
    pub current: usize,
}
