use colony_agent::AgentConfig;
use colony_core::{ColonyError, ColonyResult};
use colony_events::EventBusConfig;
use colony_router::RouterConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Task queue limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    /// Retries granted to tasks that do not set their own.
    pub default_max_retries: u32,
    /// In-progress deadline for tasks that do not set their own.
    pub task_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Completed tasks retained for inspection.
    pub history_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            default_max_retries: 3,
            task_timeout_ms: 30_000,
            sweep_interval_ms: 1000,
            history_size: 1000,
        }
    }
}

/// Auto-scaling thresholds.
///
/// Scale-up fires after the queue depth has exceeded `scale_up_queue_depth`
/// for `scale_up_sustain_checks` consecutive checks. Scale-down fires after
/// utilization stayed below `scale_down_utilization` with an empty queue for
/// `scale_down_sustain_checks` consecutive checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub scale_up_queue_depth: usize,
    pub scale_up_sustain_checks: u32,
    /// Agents added per scale-up.
    pub scale_up_step: usize,
    pub scale_down_utilization: f64,
    pub scale_down_sustain_checks: u32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 1000,
            scale_up_queue_depth: 10,
            scale_up_sustain_checks: 2,
            scale_up_step: 2,
            scale_down_utilization: 0.25,
            scale_down_sustain_checks: 5,
        }
    }
}

/// Periodic metrics collection and anomaly detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Deviation from the rolling mean, in standard deviations, that counts as an anomaly.
    pub anomaly_std_devs: f64,
    /// Prior snapshots required (and used) for anomaly detection.
    pub anomaly_window: usize,
    pub snapshot_retention: usize,
    /// Queue depth above which the health score is penalized.
    pub queue_depth_threshold: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            anomaly_std_devs: 2.0,
            anomaly_window: 10,
            snapshot_retention: 100,
            queue_depth_threshold: 100,
        }
    }
}

/// Complete swarm configuration, loadable from TOML.
///
/// ```toml
/// min_agents = 3
/// max_agents = 12
///
/// [agent]
/// max_concurrent_tasks = 4
///
/// [router]
/// retry_max_attempts = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub min_agents: usize,
    pub max_agents: usize,
    pub agent: AgentConfig,
    pub queue: QueueConfig,
    pub router: RouterConfig,
    pub events: EventBusConfig,
    pub scaling: ScalingConfig,
    pub metrics: MetricsConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            min_agents: 2,
            max_agents: 10,
            agent: AgentConfig::default(),
            queue: QueueConfig::default(),
            router: RouterConfig::default(),
            events: EventBusConfig::default(),
            scaling: ScalingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl SwarmConfig {
    pub fn from_toml_str(s: &str) -> ColonyResult<Self> {
        let config: SwarmConfig =
            toml::from_str(s).map_err(|e| ColonyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> ColonyResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ColonyError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ColonyResult<()> {
        let fail = |msg: &str| Err(ColonyError::Config(msg.to_string()));
        if self.min_agents == 0 {
            return fail("min_agents must be at least 1");
        }
        if self.min_agents > self.max_agents {
            return fail("min_agents must not exceed max_agents");
        }
        if self.agent.max_concurrent_tasks == 0 {
            return fail("agent.max_concurrent_tasks must be at least 1");
        }
        if self.agent.heartbeat_interval_ms == 0 {
            return fail("agent.heartbeat_interval_ms must be positive");
        }
        if self.queue.max_queue_size == 0 {
            return fail("queue.max_queue_size must be at least 1");
        }
        if self.queue.sweep_interval_ms == 0 || self.queue.task_timeout_ms == 0 {
            return fail("queue timers must be positive");
        }
        if self.router.retry_max_attempts == 0 {
            return fail("router.retry_max_attempts must be at least 1");
        }
        if self.router.message_timeout_ms == 0 {
            return fail("router.message_timeout_ms must be positive");
        }
        if self.scaling.check_interval_ms == 0 {
            return fail("scaling.check_interval_ms must be positive");
        }
        if self.scaling.scale_up_step == 0 {
            return fail("scaling.scale_up_step must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.scaling.scale_down_utilization) {
            return fail("scaling.scale_down_utilization must be within [0, 1]");
        }
        if self.metrics.interval_ms == 0 {
            return fail("metrics.interval_ms must be positive");
        }
        if self.metrics.anomaly_std_devs <= 0.0 || self.metrics.anomaly_window == 0 {
            return fail("metrics anomaly settings must be positive");
        }
        Ok(())
    }
}
