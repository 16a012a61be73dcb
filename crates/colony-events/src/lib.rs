//! Topic-based event bus for the Colony swarm.
//!
//! Publishing is synchronous: every matching subscriber has run by the time
//! [`EventBus::publish`] returns. Subscribers are ordered by priority and
//! then by subscription order; a failing subscriber is dead-lettered and
//! reported as a `subscription_error` signal without affecting the others.

/// The bus itself.
pub mod bus;
/// Events, history queries, and statistics.
pub mod event;

pub use bus::{EventBus, EventBusConfig, EventCallback, SubscribeOptions, Unsubscribe};
pub use event::{Event, EventDeadLetter, EventQuery, EventStatistics, WILDCARD_TOPIC};
