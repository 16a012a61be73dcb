//! Agent execution unit for the Colony swarm.
//!
//! An [`Agent`] runs up to `max_concurrent_tasks` tasks at once through a
//! [`TaskHandler`], buffers the rest locally, keeps a heartbeat, and reports
//! each finished task on a completion channel. [`SwarmState`] is the registry
//! of live agents shared by the orchestrator and the message router.

/// Agent lifecycle, execution, and messaging intake.
pub mod agent;
/// Per-agent limits.
pub mod config;
/// Seams used by the message router to reach agents.
pub mod directory;
/// Task handler trait and adapters.
pub mod handler;
/// Agent state persistence.
pub mod store;
/// Registry of live agents.
pub mod swarm;

pub use agent::{
    Agent, AgentBuilder, AgentState, AgentStatus, AgentSummary, ExecuteOutcome, TaskCompletion,
};
pub use config::AgentConfig;
pub use directory::{AgentDirectory, MessageRecipient};
pub use handler::{EchoHandler, FnHandler, TaskHandler};
pub use store::{AgentSnapshot, FileStateStore, InMemoryStateStore, StateStore};
pub use swarm::SwarmState;
