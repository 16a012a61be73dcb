use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colony_core::{ColonyError, ColonyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Persisted counters of an agent, restored when an agent with the same id starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub name: String,
    pub task_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub saved_at: DateTime<Utc>,
}

/// Persistence collaborator used for agent state rehydration.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self, agent_id: &str) -> ColonyResult<Option<AgentSnapshot>>;
    async fn save_state(&self, agent_id: &str, state: &AgentSnapshot) -> ColonyResult<()>;
}

/// Keeps snapshots in process memory.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, AgentSnapshot>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_state(&self, agent_id: &str) -> ColonyResult<Option<AgentSnapshot>> {
        Ok(self.states.read().await.get(agent_id).cloned())
    }

    async fn save_state(&self, agent_id: &str, state: &AgentSnapshot) -> ColonyResult<()> {
        self.states
            .write()
            .await
            .insert(agent_id.to_string(), state.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per agent id.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub async fn new(dir: PathBuf) -> ColonyResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn state_path(&self, agent_id: &str) -> ColonyResult<PathBuf> {
        let valid = !agent_id.is_empty()
            && agent_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ColonyError::Validation(format!(
                "agent id '{agent_id}' is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{agent_id}.json")))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_state(&self, agent_id: &str) -> ColonyResult<Option<AgentSnapshot>> {
        let path = self.state_path(agent_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let state: AgentSnapshot = serde_json::from_str(&data)?;
        Ok(Some(state))
    }

    async fn save_state(&self, agent_id: &str, state: &AgentSnapshot) -> ColonyResult<()> {
        let path = self.state_path(agent_id)?;
        let json = serde_json::to_string_pretty(state)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
