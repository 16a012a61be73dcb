//! Core types and error definitions for the Colony agent swarm.
//!
//! This crate provides the foundational types shared across all Colony crates:
//! the error taxonomy, tasks and message envelopes, the lifecycle signal
//! stream, and small statistics helpers.
//!
//! # Main types
//!
//! - [`ColonyError`] — Unified error enum, one variant per failure class.
//! - [`ColonyResult`] — Convenience alias for `Result<T, ColonyError>`.
//! - [`Priority`] — Three-tier priority shared by tasks, messages, and subscriptions.
//! - [`Task`] — A unit of work moving through the queue and onto agents.
//! - [`MessageEnvelope`] — A routed message with delivery metadata.
//! - [`Signal`] / [`SignalBus`] — Typed lifecycle signals and their fan-out stream.

/// Error taxonomy.
pub mod error;
/// Message envelopes.
pub mod envelope;
/// Lifecycle signals.
pub mod signal;
/// Percentiles and rolling statistics.
pub mod stats;
/// Tasks and task options.
pub mod task;
/// Tracing subscriber setup.
pub mod telemetry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use envelope::MessageEnvelope;
pub use error::{ColonyError, ColonyResult, ErrorKind};
pub use signal::{Signal, SignalBus, SpawnReason};
pub use stats::LatencyPercentiles;
pub use task::{Task, TaskOptions, TaskStatus};
pub use telemetry::{init_tracing, LogFormat};

/// Free-form structured metadata attached to tasks, messages, and events.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Scheduling priority. `High` runs before `Normal`, which runs before `Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Dispatch rank: 0 for `High`, 1 for `Normal`, 2 for `Low`.
    pub fn rank(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = ColonyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(ColonyError::Validation(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}
