use crate::audit::{
    AgentDeliveryStats, AuditRecord, DeadLetterMessage, DeliveryStatus, Ledger, RouterStatistics,
};
use crate::config::RouterConfig;
use chrono::Utc;
use colony_agent::{AgentDirectory, MessageRecipient};
use colony_core::{ColonyError, ColonyResult, ErrorKind, MessageEnvelope, Signal, SignalBus};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one point-to-point send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: Uuid,
    pub to: Option<String>,
    pub error_type: Option<ErrorKind>,
    pub error: Option<String>,
    /// Delivery attempts made; 0 when rejected up front.
    pub attempts: u32,
    pub latency_ms: u64,
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastResult {
    /// Id of the original envelope; each copy's `correlation_id` points back to it.
    pub message_id: Uuid,
    pub recipients: usize,
    pub delivered_count: usize,
    pub failed_count: usize,
    pub results: Vec<SendResult>,
}

/// Outcome of [`MessageRouter::send_batch`], in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<SendResult>,
}

/// Outcome of [`MessageRouter::reprocess_dead_letter_queue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Tail of one recipient's delivery line.
struct Lane {
    generation: u64,
    next: oneshot::Receiver<()>,
}

/// Per-recipient delivery lines. A lane exists only while a turn is outstanding.
#[derive(Default)]
struct Lanes {
    generation: AtomicU64,
    map: Mutex<HashMap<String, Lane>>,
}

/// A place in a recipient's delivery line.
///
/// Waits for the previous holder to drop its release half, then holds its own
/// until dropped. The last turn in a line removes the lane when dropped.
struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    _release: oneshot::Sender<()>,
    lanes: Arc<Lanes>,
    recipient: String,
    generation: u64,
}

impl Turn {
    async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = previous.await;
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        let mut map = self.lanes.map.lock();
        if map
            .get(&self.recipient)
            .is_some_and(|lane| lane.generation == self.generation)
        {
            map.remove(&self.recipient);
        }
    }
}

struct RouterInner {
    config: RouterConfig,
    directory: Arc<dyn AgentDirectory>,
    signals: SignalBus,
    lanes: Arc<Lanes>,
    ledger: Mutex<Ledger>,
    stopped: AtomicBool,
}

/// Delivers envelopes to agents with retry, backoff, an overall deadline,
/// and per-recipient ordering.
///
/// Messages to one recipient are delivered in the order `send_message`
/// (or `broadcast_message` / `send_batch`) was *called*, not the order the
/// returned futures are first polled. Different recipients proceed
/// concurrently.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, directory: Arc<dyn AgentDirectory>, signals: SignalBus) -> Self {
        let ledger = Ledger::new(config.audit_capacity, config.dead_letter_capacity);
        Self {
            inner: Arc::new(RouterInner {
                config,
                directory,
                signals,
                lanes: Arc::new(Lanes::default()),
                ledger: Mutex::new(ledger),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Deliver one envelope to its recipient.
    ///
    /// Validation problems, unknown recipients, and a stopped router fail
    /// before any attempt. Otherwise delivery is retried on transient errors
    /// until `retry_max_attempts` or `message_timeout_ms` is exhausted, after
    /// which the envelope is dead-lettered.
    pub fn send_message(
        &self,
        envelope: MessageEnvelope,
    ) -> impl Future<Output = SendResult> + Send + 'static {
        let router = self.clone();
        let admitted = self.admit(&envelope);
        async move {
            match admitted {
                Ok((recipient, turn)) => router.deliver(envelope, recipient, turn).await,
                Err(e) => router.reject(&envelope, e),
            }
        }
    }

    /// Deliver a copy of `envelope` to every known agent except the sender.
    pub fn broadcast_message(
        &self,
        envelope: MessageEnvelope,
    ) -> impl Future<Output = BroadcastResult> + Send + 'static {
        let sends: Vec<_> = self
            .inner
            .directory
            .agent_ids()
            .into_iter()
            .filter(|id| *id != envelope.from_agent_id)
            .map(|id| self.send_message(envelope.addressed_copy(id)))
            .collect();
        let message_id = envelope.id;
        let from = envelope.from_agent_id;
        async move {
            let results = join_all(sends).await;
            let delivered_count = results.iter().filter(|r| r.success).count();
            info!(
                message_id = %message_id,
                from = %from,
                recipients = results.len(),
                delivered = delivered_count,
                "Broadcast finished"
            );
            BroadcastResult {
                message_id,
                recipients: results.len(),
                delivered_count,
                failed_count: results.len() - delivered_count,
                results,
            }
        }
    }

    /// Send every envelope, concurrently across recipients and in list order
    /// per recipient.
    pub fn send_batch(
        &self,
        messages: Vec<MessageEnvelope>,
    ) -> impl Future<Output = BatchResult> + Send + 'static {
        let sends: Vec<_> = messages
            .into_iter()
            .map(|envelope| self.send_message(envelope))
            .collect();
        async move {
            let results = join_all(sends).await;
            let succeeded = results.iter().filter(|r| r.success).count();
            BatchResult {
                total: results.len(),
                succeeded,
                failed: results.len() - succeeded,
                results,
            }
        }
    }

    /// Re-attempt every dead-lettered message with a fresh retry budget.
    ///
    /// Messages that fail again go back into the dead-letter queue, including
    /// ones that can no longer be admitted (unknown recipient, stopped router).
    pub async fn reprocess_dead_letter_queue(&self) -> ReprocessReport {
        let entries = self.inner.ledger.lock().take_dead_letters();
        if entries.is_empty() {
            return ReprocessReport::default();
        }
        let attempted = entries.len();
        let mut sends = Vec::with_capacity(attempted);
        let mut unadmitted = Vec::new();
        for entry in entries {
            let mut envelope = entry.envelope.clone();
            envelope.retry_count = 0;
            match self.admit(&envelope) {
                Ok((recipient, turn)) => sends.push(self.deliver(envelope, recipient, turn)),
                Err(e) => {
                    debug!(message_id = %envelope.id, error = %e, "Dead letter not re-admitted");
                    unadmitted.push(DeadLetterMessage {
                        error_type: e.kind(),
                        error: e.to_string(),
                        failed_at: Utc::now(),
                        ..entry
                    });
                }
            }
        }
        let results = join_all(sends).await;
        if !unadmitted.is_empty() {
            let mut ledger = self.inner.ledger.lock();
            for entry in unadmitted {
                ledger.dead_letter(entry);
            }
        }
        let succeeded = results.iter().filter(|r| r.success).count();
        let report = ReprocessReport {
            attempted,
            succeeded,
            failed: attempted - succeeded,
        };
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            "Reprocessed message dead-letter queue"
        );
        report
    }

    pub fn dead_letter_queue(&self) -> Vec<DeadLetterMessage> {
        self.inner.ledger.lock().dead_letters()
    }

    /// Drop every dead-lettered message, returning how many were dropped.
    pub fn clear_dead_letter_queue(&self) -> usize {
        self.inner.ledger.lock().take_dead_letters().len()
    }

    /// The most recent `limit` audit records (all when `None`), oldest first.
    pub fn audit_trail(&self, limit: Option<usize>) -> Vec<AuditRecord> {
        self.inner.ledger.lock().audit_tail(limit)
    }

    pub fn get_statistics(&self) -> RouterStatistics {
        self.inner.ledger.lock().statistics()
    }

    pub fn get_agent_statistics(&self, agent_id: &str) -> Option<AgentDeliveryStats> {
        self.inner.ledger.lock().agent_statistics(agent_id)
    }

    /// Drop the per-agent statistics of an agent that left the swarm.
    ///
    /// Router-wide totals and the audit trail are kept.
    pub fn forget_agent(&self, agent_id: &str) {
        self.inner.ledger.lock().forget_agent(agent_id);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Reject new sends and stop retrying in-flight ones. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.lanes.map.lock().clear();
        info!("Message router stopped");
    }

    fn admit(
        &self,
        envelope: &MessageEnvelope,
    ) -> ColonyResult<(Arc<dyn MessageRecipient>, Turn)> {
        if self.is_stopped() {
            return Err(ColonyError::Shutdown("message router is stopped".into()));
        }
        if envelope.from_agent_id.trim().is_empty() {
            return Err(ColonyError::Validation("sender id must not be empty".into()));
        }
        let Some(to) = envelope.to_agent_id.as_deref() else {
            return Err(ColonyError::Validation(
                "envelope has no recipient; use broadcast_message".into(),
            ));
        };
        let recipient = self
            .inner
            .directory
            .lookup(to)
            .ok_or_else(|| ColonyError::NotFound(format!("agent {to} not found")))?;
        Ok((recipient, self.take_turn(to)))
    }

    fn take_turn(&self, recipient: &str) -> Turn {
        let (release, next) = oneshot::channel();
        let lanes = self.inner.lanes.clone();
        let generation = lanes.generation.fetch_add(1, Ordering::Relaxed);
        let previous = lanes
            .map
            .lock()
            .insert(recipient.to_string(), Lane { generation, next })
            .map(|lane| lane.next);
        Turn {
            previous,
            _release: release,
            lanes,
            recipient: recipient.to_string(),
            generation,
        }
    }

    async fn deliver(
        &self,
        mut envelope: MessageEnvelope,
        recipient: Arc<dyn MessageRecipient>,
        mut turn: Turn,
    ) -> SendResult {
        turn.wait().await;

        let config = &self.inner.config;
        let max_attempts = config.retry_max_attempts.max(1);
        let started = Instant::now();
        let deadline = started + Duration::from_millis(config.message_timeout_ms);
        let mut attempts = 0u32;

        let failure = loop {
            if self.is_stopped() {
                break ColonyError::Shutdown("message router is stopped".into());
            }
            attempts += 1;
            envelope.retry_count = attempts - 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match tokio::time::timeout(remaining, recipient.deliver(&envelope)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(self.timeout_error()),
            };
            let error = match outcome {
                Ok(()) => return self.delivered(&envelope, attempts, started),
                Err(e) => e,
            };
            if !error.is_retryable() || attempts >= max_attempts {
                break error;
            }

            let delay_ms = config.backoff_delay_ms(attempts);
            if Instant::now() + Duration::from_millis(delay_ms) >= deadline {
                break self.timeout_error();
            }
            self.inner
                .ledger
                .lock()
                .record_retry(&envelope.from_agent_id);
            debug!(
                message_id = %envelope.id,
                to = %recipient.recipient_id(),
                attempt = attempts,
                delay_ms,
                error = %error,
                "Delivery failed, retrying"
            );
            self.inner.signals.emit(Signal::MessageRetrying {
                message_id: envelope.id,
                to: recipient.recipient_id().to_string(),
                attempt: attempts + 1,
                delay_ms,
                error: error.to_string(),
            });
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        };

        self.dead_letter(envelope, failure, attempts, started)
    }

    fn timeout_error(&self) -> ColonyError {
        ColonyError::Timeout(format!(
            "delivery exceeded {}ms",
            self.inner.config.message_timeout_ms
        ))
    }

    fn delivered(&self, envelope: &MessageEnvelope, attempts: u32, started: Instant) -> SendResult {
        let latency_ms = started.elapsed().as_millis() as u64;
        let to = envelope.to_agent_id.clone().unwrap_or_default();
        self.inner.ledger.lock().record(AuditRecord {
            message_id: envelope.id,
            from: envelope.from_agent_id.clone(),
            to: Some(to.clone()),
            timestamp: Utc::now(),
            status: DeliveryStatus::Delivered,
            attempts,
            latency_ms,
            error_type: None,
        });
        debug!(message_id = %envelope.id, to = %to, attempts, latency_ms, "Message delivered");
        self.inner.signals.emit(Signal::MessageSent {
            message_id: envelope.id,
            from: envelope.from_agent_id.clone(),
            to: to.clone(),
            attempts,
        });
        SendResult {
            success: true,
            message_id: envelope.id,
            to: Some(to),
            error_type: None,
            error: None,
            attempts,
            latency_ms,
        }
    }

    fn reject(&self, envelope: &MessageEnvelope, error: ColonyError) -> SendResult {
        debug!(message_id = %envelope.id, error = %error, "Message rejected");
        self.fail(envelope, error, 0, 0, DeliveryStatus::Rejected)
    }

    fn dead_letter(
        &self,
        envelope: MessageEnvelope,
        error: ColonyError,
        attempts: u32,
        started: Instant,
    ) -> SendResult {
        let latency_ms = started.elapsed().as_millis() as u64;
        warn!(
            message_id = %envelope.id,
            to = ?envelope.to_agent_id,
            attempts,
            error = %error,
            "Message dead-lettered"
        );
        self.inner.ledger.lock().dead_letter(DeadLetterMessage {
            envelope: envelope.clone(),
            error_type: error.kind(),
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        });
        self.fail(&envelope, error, attempts, latency_ms, DeliveryStatus::DeadLettered)
    }

    fn fail(
        &self,
        envelope: &MessageEnvelope,
        error: ColonyError,
        attempts: u32,
        latency_ms: u64,
        status: DeliveryStatus,
    ) -> SendResult {
        let error_type = error.kind();
        let message = error.to_string();
        self.inner.ledger.lock().record(AuditRecord {
            message_id: envelope.id,
            from: envelope.from_agent_id.clone(),
            to: envelope.to_agent_id.clone(),
            timestamp: Utc::now(),
            status,
            attempts,
            latency_ms,
            error_type: Some(error_type),
        });
        self.inner.signals.emit(Signal::MessageFailed {
            message_id: envelope.id,
            from: envelope.from_agent_id.clone(),
            to: envelope.to_agent_id.clone(),
            error_type,
            error: message.clone(),
        });
        SendResult {
            success: false,
            message_id: envelope.id,
            to: envelope.to_agent_id.clone(),
            error_type: Some(error_type),
            error: Some(message),
            attempts,
            latency_ms,
        }
    }
}
