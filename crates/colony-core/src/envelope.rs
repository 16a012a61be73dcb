use crate::{Metadata, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The structured wrapper around a message payload and its delivery metadata.
///
/// Envelopes are created by the sender and treated as immutable once handed
/// to the router; only `retry_count` changes while delivery is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub from_agent_id: String,
    /// `None` for broadcast.
    pub to_agent_id: Option<String>,
    pub content: serde_json::Value,
    pub content_type: String,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl MessageEnvelope {
    /// Creates a point-to-point envelope with a JSON content type.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_agent_id: from.into(),
            to_agent_id: Some(to.into()),
            content,
            content_type: "application/json".to_string(),
            priority: Priority::Normal,
            timestamp: Utc::now(),
            correlation_id: None,
            retry_count: 0,
            metadata: Metadata::new(),
        }
    }

    /// Creates an envelope with no recipient, for fan-out to every agent.
    pub fn broadcast(from: impl Into<String>, content: serde_json::Value) -> Self {
        let mut env = Self::new(from, String::new(), content);
        env.to_agent_id = None;
        env
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// A copy addressed to `to`, with a fresh id correlated to this envelope.
    pub fn addressed_copy(&self, to: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.to_agent_id = Some(to.into());
        copy.correlation_id = Some(
            self.correlation_id
                .clone()
                .unwrap_or_else(|| self.id.to_string()),
        );
        copy.retry_count = 0;
        copy
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_agent_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_to_point() {
        let env = MessageEnvelope::new("agent-0001", "agent-0002", serde_json::json!("hi"));
        assert_eq!(env.to_agent_id.as_deref(), Some("agent-0002"));
        assert_eq!(env.content_type, "application/json");
        assert!(!env.is_broadcast());
    }

    #[test]
    fn test_addressed_copy_correlates_to_original() {
        let env = MessageEnvelope::broadcast("agent-0001", serde_json::json!({"op": "sync"}));
        assert!(env.is_broadcast());

        let copy = env.addressed_copy("agent-0003");
        assert_ne!(copy.id, env.id);
        assert_eq!(copy.to_agent_id.as_deref(), Some("agent-0003"));
        assert_eq!(copy.correlation_id, Some(env.id.to_string()));
    }

    #[test]
    fn test_addressed_copy_keeps_caller_correlation() {
        let env = MessageEnvelope::broadcast("a", serde_json::Value::Null).with_correlation_id("trace-1");
        assert_eq!(env.addressed_copy("b").correlation_id.as_deref(), Some("trace-1"));
    }
}
