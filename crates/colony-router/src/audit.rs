use chrono::{DateTime, Utc};
use colony_core::{ErrorKind, MessageEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Terminal outcome of one `send_message` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// Rejected before any delivery attempt (validation, unknown recipient, shutdown).
    Rejected,
    /// Attempts or deadline exhausted; the envelope is in the dead-letter queue.
    DeadLettered,
}

/// One entry of the router's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub message_id: Uuid,
    pub from: String,
    pub to: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub latency_ms: u64,
    pub error_type: Option<ErrorKind>,
}

/// A message that exhausted its delivery attempts or deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub envelope: MessageEnvelope,
    pub error_type: ErrorKind,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Router-wide delivery counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStatistics {
    pub sent: u64,
    pub failed: u64,
    pub retries: u64,
    pub average_latency_ms: f64,
    pub dead_letters: usize,
    pub audit_records: usize,
}

/// Delivery counters for one agent, as sender and as recipient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDeliveryStats {
    pub agent_id: String,
    /// Messages from this agent that were delivered.
    pub sent: u64,
    /// Messages delivered to this agent.
    pub received: u64,
    /// Messages from this agent that failed.
    pub failed: u64,
    pub retries: u64,
    /// Mean latency of this agent's delivered messages.
    pub average_latency_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
    pub retries: u64,
    pub latency_total_ms: u64,
}

impl Counters {
    fn average_latency_ms(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.latency_total_ms as f64 / self.sent as f64
        }
    }
}

/// Audit trail, dead letters, and counters, guarded together by the router.
pub(crate) struct Ledger {
    audit: VecDeque<AuditRecord>,
    audit_capacity: usize,
    dead_letters: VecDeque<DeadLetterMessage>,
    dead_letter_capacity: usize,
    global: Counters,
    per_agent: HashMap<String, Counters>,
}

impl Ledger {
    pub fn new(audit_capacity: usize, dead_letter_capacity: usize) -> Self {
        Self {
            audit: VecDeque::new(),
            audit_capacity,
            dead_letters: VecDeque::new(),
            dead_letter_capacity,
            global: Counters::default(),
            per_agent: HashMap::new(),
        }
    }

    pub fn record(&mut self, record: AuditRecord) {
        match record.status {
            DeliveryStatus::Delivered => {
                self.global.sent += 1;
                self.global.latency_total_ms += record.latency_ms;
                let sender = self.per_agent.entry(record.from.clone()).or_default();
                sender.sent += 1;
                sender.latency_total_ms += record.latency_ms;
                if let Some(to) = &record.to {
                    self.per_agent.entry(to.clone()).or_default().received += 1;
                }
            }
            DeliveryStatus::Rejected | DeliveryStatus::DeadLettered => {
                self.global.failed += 1;
                self.per_agent.entry(record.from.clone()).or_default().failed += 1;
            }
        }
        if self.audit_capacity > 0 {
            self.audit.push_back(record);
            while self.audit.len() > self.audit_capacity {
                self.audit.pop_front();
            }
        }
    }

    pub fn record_retry(&mut self, from: &str) {
        self.global.retries += 1;
        self.per_agent.entry(from.to_string()).or_default().retries += 1;
    }

    pub fn dead_letter(&mut self, entry: DeadLetterMessage) {
        if self.dead_letter_capacity == 0 {
            return;
        }
        self.dead_letters.push_back(entry);
        while self.dead_letters.len() > self.dead_letter_capacity {
            self.dead_letters.pop_front();
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterMessage> {
        self.dead_letters.iter().cloned().collect()
    }

    pub fn take_dead_letters(&mut self) -> Vec<DeadLetterMessage> {
        self.dead_letters.drain(..).collect()
    }

    /// The most recent `limit` records (all when `None`), oldest first.
    pub fn audit_tail(&self, limit: Option<usize>) -> Vec<AuditRecord> {
        let skip = limit.map_or(0, |l| self.audit.len().saturating_sub(l));
        self.audit.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> RouterStatistics {
        RouterStatistics {
            sent: self.global.sent,
            failed: self.global.failed,
            retries: self.global.retries,
            average_latency_ms: self.global.average_latency_ms(),
            dead_letters: self.dead_letters.len(),
            audit_records: self.audit.len(),
        }
    }

    pub fn forget_agent(&mut self, agent_id: &str) {
        self.per_agent.remove(agent_id);
    }

    pub fn agent_statistics(&self, agent_id: &str) -> Option<AgentDeliveryStats> {
        self.per_agent.get(agent_id).map(|c| AgentDeliveryStats {
            agent_id: agent_id.to_string(),
            sent: c.sent,
            received: c.received,
            failed: c.failed,
            retries: c.retries,
            average_latency_ms: c.average_latency_ms(),
        })
    }
}
