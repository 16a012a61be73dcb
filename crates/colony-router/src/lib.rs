//! Reliable messaging between Colony agents.
//!
//! [`MessageRouter`] resolves recipients through an
//! [`AgentDirectory`](colony_agent::AgentDirectory), retries transient
//! failures with exponential backoff under an overall deadline, keeps
//! per-recipient delivery order, and records every outcome in a bounded
//! audit trail. Messages that exhaust their budget land in a dead-letter
//! queue that can be reprocessed later.

/// Audit trail, dead letters, and delivery statistics.
pub mod audit;
/// Retry and retention settings.
pub mod config;
/// The router.
pub mod router;

pub use audit::{AgentDeliveryStats, AuditRecord, DeadLetterMessage, DeliveryStatus, RouterStatistics};
pub use config::RouterConfig;
pub use router::{BatchResult, BroadcastResult, MessageRouter, ReprocessReport, SendResult};
