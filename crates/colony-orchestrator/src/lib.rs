//! Swarm orchestration for Colony.
//!
//! Ties agents, the message router, and the event bus together behind a
//! single [`Orchestrator`]: tasks are queued by priority, handed to the
//! least-busy agent, retried or dead-lettered on failure, and the swarm grows
//! and shrinks with queue pressure.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Owns the swarm and its background loops.
//! - [`TaskQueue`] — Three-tier priority queue with retries, timeouts, and a dead-letter queue.
//! - [`MetricsCollector`] — Periodic health snapshots with anomaly detection.
//! - [`SwarmConfig`] — TOML-loadable configuration for every component.

/// Swarm configuration.
pub mod config;
/// Health snapshots and anomaly detection.
pub mod metrics;
/// The orchestrator engine.
pub mod orchestrator;
/// Priority task queue.
pub mod task_queue;
/// Status and report types.
pub mod types;

pub use config::{MetricsConfig, QueueConfig, ScalingConfig, SwarmConfig};
pub use metrics::{
    detect_anomalies, health_score, Anomaly, HealthInputs, MetricsCollector, MetricsSnapshot,
    ResourceUtilization,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SIGNAL_TOPIC_PREFIX};
pub use task_queue::{
    Attempt, DeadLetterTask, EnqueueReceipt, FailureDisposition, QueueDepth, QueueStatistics,
    TaskQueue,
};
pub use types::{AgentLoad, HealthStatus, ScaleResult, SwarmHealth, SwarmMetrics, SwarmStatus};
