use crate::config::MetricsConfig;
use crate::task_queue::TaskQueue;
use chrono::{DateTime, Utc};
use colony_agent::SwarmState;
use colony_core::stats::mean_std_dev;
use colony_core::{LatencyPercentiles, Signal, SignalBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Utilization of each bounded resource, in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    /// Busy execution slots over total slots.
    pub agent_slots: f64,
    /// Queued tasks over queue capacity.
    pub queue: f64,
    /// Share of agents that are alive and heartbeating.
    pub healthy_agents: f64,
}

/// One periodic observation of the swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub agent_count: usize,
    pub healthy_agents: usize,
    pub active_tasks: usize,
    pub queue_depth: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Completed over completed plus failed attempts; 1.0 before any finished.
    pub success_rate: f64,
    /// Completed tasks per second since the previous snapshot.
    pub throughput_per_sec: f64,
    /// Over each agent's most recent task duration.
    pub latency: LatencyPercentiles,
    pub utilization: ResourceUtilization,
    pub health_score: f64,
}

/// A metric that left its rolling band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub timestamp: DateTime<Utc>,
}

/// Inputs to [`health_score`].
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub success_rate: f64,
    pub queue_depth: usize,
    pub queue_depth_threshold: usize,
    pub p99_latency_ms: u64,
    pub utilization: f64,
    pub agent_count: usize,
}

const SLOW_P99_MS: u64 = 1000;
const LOW_UTILIZATION: f64 = 0.1;

/// Composite health in `[0, 100]`.
///
/// Starts at 100. Success below 95% costs one point per lost percent (times
/// two). A queue past its threshold costs 15, p99 latency over one second
/// costs 10, and under-utilization of a non-empty swarm costs 5. Success
/// above 99% earns a 5 point bonus.
pub fn health_score(inputs: &HealthInputs) -> f64 {
    let mut score = 100.0;
    if inputs.success_rate < 0.95 {
        score -= (0.95 - inputs.success_rate) * 200.0;
    }
    if inputs.queue_depth > inputs.queue_depth_threshold {
        score -= 15.0;
    }
    if inputs.p99_latency_ms > SLOW_P99_MS {
        score -= 10.0;
    }
    if inputs.agent_count > 0 && inputs.utilization < LOW_UTILIZATION {
        score -= 5.0;
    }
    if inputs.success_rate > 0.99 {
        score += 5.0;
    }
    score.clamp(0.0, 100.0)
}

fn success_rate(s: &MetricsSnapshot) -> f64 {
    s.success_rate
}

fn queue_depth(s: &MetricsSnapshot) -> f64 {
    s.queue_depth as f64
}

fn slot_utilization(s: &MetricsSnapshot) -> f64 {
    s.utilization.agent_slots
}

/// Metrics checked for anomalies, with their extractor.
const TRACKED: [(&str, fn(&MetricsSnapshot) -> f64); 3] = [
    ("success_rate", success_rate),
    ("queue_depth", queue_depth),
    ("utilization", slot_utilization),
];

/// Compare `current` against the last `window` snapshots of `prior`.
///
/// Nothing is flagged until `prior` holds at least `window` snapshots. With a
/// zero standard deviation any different value counts as anomalous.
pub fn detect_anomalies(
    prior: &[MetricsSnapshot],
    current: &MetricsSnapshot,
    window: usize,
    std_devs: f64,
) -> Vec<Anomaly> {
    if window == 0 || prior.len() < window {
        return Vec::new();
    }
    let recent = &prior[prior.len() - window..];
    TRACKED
        .iter()
        .filter_map(|(name, extract)| {
            let values: Vec<f64> = recent.iter().map(extract).collect();
            let (mean, std_dev) = mean_std_dev(&values)?;
            let value = extract(current);
            let deviation = (value - mean).abs();
            let anomalous = if std_dev == 0.0 {
                deviation > f64::EPSILON
            } else {
                deviation > std_devs * std_dev
            };
            anomalous.then(|| Anomaly {
                metric: (*name).to_string(),
                value,
                mean,
                std_dev,
                timestamp: current.timestamp,
            })
        })
        .collect()
}

struct Baseline {
    at: Instant,
    completed: u64,
}

#[derive(Default)]
struct CollectorState {
    snapshots: VecDeque<MetricsSnapshot>,
    anomalies: VecDeque<Anomaly>,
    baseline: Option<Baseline>,
}

struct CollectorInner {
    config: MetricsConfig,
    swarm: Arc<SwarmState>,
    queue: TaskQueue,
    signals: SignalBus,
    state: Mutex<CollectorState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Periodically samples the swarm and task queue into health snapshots.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
}

impl MetricsCollector {
    pub fn new(
        config: MetricsConfig,
        swarm: Arc<SwarmState>,
        queue: TaskQueue,
        signals: SignalBus,
    ) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                config,
                swarm,
                queue,
                signals,
                state: Mutex::new(CollectorState::default()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Take a snapshot now, check it for anomalies, and retain both.
    pub fn collect(&self) -> MetricsSnapshot {
        let config = &self.inner.config;
        let agents = self.inner.swarm.agents();
        let statuses: Vec<_> = agents.iter().map(|a| a.get_status()).collect();
        let queue_stats = self.inner.queue.get_queue_statistics();

        let agent_count = statuses.len();
        let healthy_agents = agents.iter().filter(|a| a.is_healthy()).count();
        let active_tasks: usize = statuses.iter().map(|s| s.active_tasks).sum();
        let slots: usize = statuses.iter().map(|s| s.max_concurrent_tasks).sum();
        let durations: Vec<u64> = statuses
            .iter()
            .filter_map(|s| s.last_task_duration_ms)
            .collect();
        let latency = LatencyPercentiles::from_samples(&durations);

        let finished = queue_stats.completed + queue_stats.failed;
        let success_rate = if finished == 0 {
            1.0
        } else {
            queue_stats.completed as f64 / finished as f64
        };
        let utilization = ResourceUtilization {
            agent_slots: ratio(active_tasks, slots),
            queue: ratio(queue_stats.queued, self.inner.queue.config().max_queue_size),
            healthy_agents: ratio(healthy_agents, agent_count),
        };

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let throughput_per_sec = match &state.baseline {
            Some(prev) => {
                let secs = now.duration_since(prev.at).as_secs_f64();
                if secs > 0.0 {
                    queue_stats.completed.saturating_sub(prev.completed) as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        state.baseline = Some(Baseline {
            at: now,
            completed: queue_stats.completed,
        });

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            agent_count,
            healthy_agents,
            active_tasks,
            queue_depth: queue_stats.queued,
            tasks_completed: queue_stats.completed,
            tasks_failed: queue_stats.failed,
            success_rate,
            throughput_per_sec,
            latency,
            utilization,
            health_score: health_score(&HealthInputs {
                success_rate,
                queue_depth: queue_stats.queued,
                queue_depth_threshold: config.queue_depth_threshold,
                p99_latency_ms: latency.p99,
                utilization: utilization.agent_slots,
                agent_count,
            }),
        };

        let prior: Vec<MetricsSnapshot> = state.snapshots.iter().cloned().collect();
        let anomalies = detect_anomalies(
            &prior,
            &snapshot,
            config.anomaly_window,
            config.anomaly_std_devs,
        );

        let retention = config.snapshot_retention.max(config.anomaly_window);
        state.snapshots.push_back(snapshot.clone());
        while state.snapshots.len() > retention {
            state.snapshots.pop_front();
        }
        for anomaly in &anomalies {
            state.anomalies.push_back(anomaly.clone());
        }
        while state.anomalies.len() > retention {
            state.anomalies.pop_front();
        }
        drop(state);

        for anomaly in anomalies {
            warn!(
                metric = %anomaly.metric,
                value = anomaly.value,
                mean = anomaly.mean,
                std_dev = anomaly.std_dev,
                "Metric anomaly detected"
            );
            self.inner.signals.emit(Signal::AnomalyDetected {
                metric: anomaly.metric,
                value: anomaly.value,
                mean: anomaly.mean,
                std_dev: anomaly.std_dev,
            });
        }
        debug!(
            agents = snapshot.agent_count,
            queue_depth = snapshot.queue_depth,
            health = snapshot.health_score,
            "Metrics collected"
        );
        snapshot
    }

    /// Retained snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.inner.state.lock().snapshots.iter().cloned().collect()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.inner.state.lock().anomalies.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.inner.state.lock().snapshots.back().cloned()
    }

    /// Arm the collection timer. Idempotent; no-op when disabled.
    pub fn start(&self) {
        if !self.inner.config.enabled {
            return;
        }
        let mut slot = self.inner.timer.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<CollectorInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.interval_ms.max(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                MetricsCollector { inner }.collect();
            }
        }));
    }

    /// Disarm the collection timer. Idempotent.
    pub fn stop(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
