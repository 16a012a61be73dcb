use crate::agent::Agent;
use crate::directory::{AgentDirectory, MessageRecipient};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The set of live agents owned by one orchestrator.
///
/// Iteration is in ascending agent id order, which for ids produced by
/// [`SwarmState::allocate_id`] equals spawn order.
#[derive(Default)]
pub struct SwarmState {
    agents: RwLock<BTreeMap<String, Agent>>,
    next_id: AtomicU64,
}

impl SwarmState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next zero-padded agent id (`agent-0001`, `agent-0002`, ...).
    pub fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("agent-{n:04}")
    }

    /// Register an agent. Returns the agent previously stored under the same id.
    pub fn insert(&self, agent: Agent) -> Option<Agent> {
        self.agents.write().insert(agent.id().to_string(), agent)
    }

    pub fn remove(&self, agent_id: &str) -> Option<Agent> {
        self.agents.write().remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    /// Handles to every agent, in id order.
    pub fn agents(&self) -> Vec<Agent> {
        self.agents.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Remove and return every agent.
    pub fn drain(&self) -> Vec<Agent> {
        std::mem::take(&mut *self.agents.write())
            .into_values()
            .collect()
    }
}

impl AgentDirectory for SwarmState {
    fn lookup(&self, agent_id: &str) -> Option<Arc<dyn MessageRecipient>> {
        self.get(agent_id)
            .map(|agent| Arc::new(agent) as Arc<dyn MessageRecipient>)
    }

    fn agent_ids(&self) -> Vec<String> {
        self.ids()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::EchoHandler;

    fn agent(swarm: &SwarmState) -> Agent {
        Agent::builder(swarm.allocate_id(), Arc::new(EchoHandler)).build()
    }

    #[test]
    fn test_ids_are_padded_and_ordered() {
        let swarm = SwarmState::new();
        for _ in 0..12 {
            swarm.insert(agent(&swarm));
        }
        let ids = swarm.ids();
        assert_eq!(ids.first().unwrap(), "agent-0001");
        assert_eq!(ids.last().unwrap(), "agent-0012");
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_directory_lookup() {
        let swarm = SwarmState::new();
        let a = agent(&swarm);
        let id = a.id().to_string();
        swarm.insert(a);

        let found = swarm.lookup(&id).unwrap();
        assert_eq!(found.recipient_id(), id);
        assert!(swarm.lookup("agent-9999").is_none());
        assert_eq!(swarm.agent_ids(), vec![id.clone()]);

        assert!(swarm.remove(&id).is_some());
        assert!(swarm.is_empty());
    }

    #[test]
    fn test_drain_empties_registry() {
        let swarm = SwarmState::new();
        swarm.insert(agent(&swarm));
        swarm.insert(agent(&swarm));
        assert_eq!(swarm.drain().len(), 2);
        assert_eq!(swarm.len(), 0);
    }
}
