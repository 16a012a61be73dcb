use async_trait::async_trait;
use colony_core::{ColonyResult, MessageEnvelope};
use std::sync::Arc;

/// Something the message router can hand an envelope to.
#[async_trait]
pub trait MessageRecipient: Send + Sync {
    fn recipient_id(&self) -> &str;

    /// Accept one envelope. Transient failures should return a retryable error.
    async fn deliver(&self, envelope: &MessageEnvelope) -> ColonyResult<()>;
}

/// Lookup of live recipients by agent id.
pub trait AgentDirectory: Send + Sync {
    fn lookup(&self, agent_id: &str) -> Option<Arc<dyn MessageRecipient>>;

    /// Ids of every known recipient, in ascending order.
    fn agent_ids(&self) -> Vec<String>;
}
