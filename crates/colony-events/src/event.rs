use chrono::{DateTime, Utc};
use colony_core::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Topic that matches every published event when used in a subscription.
pub const WILDCARD_TOPIC: &str = "*";

/// A published event. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Publish order across all topics, starting at 1.
    pub sequence: u64,
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Filter for [`crate::EventBus::query_event_history`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    pub topic: Option<String>,
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(topic) = &self.topic {
            if topic != WILDCARD_TOPIC && topic != &event.topic {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if event.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        true
    }
}

/// A subscriber invocation that failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDeadLetter {
    pub event: Event,
    pub subscription_id: u64,
    /// The topic the failing subscription was registered on.
    pub subscription_topic: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Counters reported by [`crate::EventBus::get_event_statistics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventStatistics {
    pub total_published: u64,
    pub per_topic: BTreeMap<String, u64>,
    pub subscriptions: usize,
    pub retained_events: usize,
    pub dead_letters: usize,
    pub failed_deliveries: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn event(topic: &str, source: Option<&str>) -> Event {
        Event {
            id: Uuid::new_v4(),
            sequence: 1,
            topic: topic.into(),
            payload: serde_json::Value::Null,
            metadata: Metadata::new(),
            source: source.map(String::from),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_query_matching() {
        let e = event("orders", Some("billing"));
        assert!(EventQuery::new().matches(&e));
        assert!(EventQuery::new().with_topic("orders").matches(&e));
        assert!(EventQuery::new().with_topic("*").matches(&e));
        assert!(!EventQuery::new().with_topic("users").matches(&e));
        assert!(EventQuery::new().with_source("billing").matches(&e));
        assert!(!EventQuery::new().with_source("shipping").matches(&e));
        assert!(!EventQuery::new()
            .with_since(e.timestamp + chrono::Duration::seconds(1))
            .matches(&e));
        assert!(!EventQuery::new()
            .with_source("billing")
            .matches(&event("orders", None)));
    }
}
