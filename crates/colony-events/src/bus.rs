use crate::event::{Event, EventDeadLetter, EventQuery, EventStatistics, WILDCARD_TOPIC};
use chrono::Utc;
use colony_core::{ColonyError, ColonyResult, Metadata, Priority, Signal, SignalBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Subscriber callback. Returning an error (or panicking) dead-letters the delivery.
pub type EventCallback = Arc<dyn Fn(&Event) -> ColonyResult<()> + Send + Sync>;

/// Retention limits for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Events retained per topic; the oldest is evicted first.
    pub history_size: usize,
    pub dead_letter_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            dead_letter_capacity: 1000,
        }
    }
}

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    pub priority: Priority,
    /// Remove the subscription after its first successful invocation.
    pub once_only: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn once(mut self) -> Self {
        self.once_only = true;
        self
    }
}

struct Subscription {
    id: u64,
    topic: String,
    priority: Priority,
    once_only: bool,
    /// Set while a once-only subscription is being (or has been) invoked.
    claimed: AtomicBool,
    callback: EventCallback,
}

impl Subscription {
    fn matches(&self, topic: &str) -> bool {
        self.topic == WILDCARD_TOPIC || self.topic == topic
    }
}

#[derive(Default)]
struct BusState {
    subscriptions: Vec<Arc<Subscription>>,
    history: HashMap<String, VecDeque<Event>>,
    dead_letters: VecDeque<EventDeadLetter>,
    total_published: u64,
    per_topic: BTreeMap<String, u64>,
    failed_deliveries: u64,
}

impl BusState {
    fn retained(&self) -> Vec<Event> {
        let mut all: Vec<Event> = self.history.values().flatten().cloned().collect();
        all.sort_by_key(|e| e.sequence);
        all
    }
}

struct BusInner {
    config: EventBusConfig,
    signals: SignalBus,
    state: Mutex<BusState>,
    next_subscription: AtomicU64,
    stopped: AtomicBool,
}

impl BusInner {
    fn remove_subscription(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != id);
        state.subscriptions.len() != before
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Unsubscribe::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Unsubscribe {
    bus: Weak<BusInner>,
    id: u64,
}

impl Unsubscribe {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.remove_subscription(self.id))
    }
}

/// Topic-based publish/subscribe with synchronous, priority-ordered delivery.
///
/// Subscribers run on the publishing thread: `High` first, then `Normal`,
/// then `Low`, and in subscription order within a tier. Callbacks may
/// publish or subscribe re-entrantly.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default(), SignalBus::new())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig, signals: SignalBus) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                signals,
                state: Mutex::new(BusState::default()),
                next_subscription: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    pub fn signals(&self) -> &SignalBus {
        &self.inner.signals
    }

    /// Register `callback` for `topic` (or `*` for every topic).
    pub fn subscribe<F>(
        &self,
        topic: impl Into<String>,
        callback: F,
        options: SubscribeOptions,
    ) -> ColonyResult<Unsubscribe>
    where
        F: Fn(&Event) -> ColonyResult<()> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(ColonyError::Validation("topic must not be empty".into()));
        }
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription {
            id,
            topic: topic.clone(),
            priority: options.priority,
            once_only: options.once_only,
            claimed: AtomicBool::new(false),
            callback: Arc::new(callback),
        });
        self.inner.state.lock().subscriptions.push(subscription);
        debug!(topic = %topic, subscription_id = id, priority = %options.priority, "Subscribed");
        Ok(Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Record an event and deliver it to every matching subscriber before returning.
    pub fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        metadata: Metadata,
        source: Option<&str>,
    ) -> ColonyResult<Event> {
        self.ensure_running()?;
        if topic.trim().is_empty() {
            return Err(ColonyError::Validation("topic must not be empty".into()));
        }
        if topic == WILDCARD_TOPIC {
            return Err(ColonyError::Validation(
                "the wildcard topic can only be subscribed to".into(),
            ));
        }

        let (event, mut subscribers) = {
            let mut state = self.inner.state.lock();
            state.total_published += 1;
            *state.per_topic.entry(topic.to_string()).or_insert(0) += 1;
            let event = Event {
                id: Uuid::new_v4(),
                sequence: state.total_published,
                topic: topic.to_string(),
                payload,
                metadata,
                source: source.map(String::from),
                timestamp: Utc::now(),
            };

            let limit = self.inner.config.history_size;
            if limit > 0 {
                let history = state.history.entry(topic.to_string()).or_default();
                history.push_back(event.clone());
                while history.len() > limit {
                    history.pop_front();
                }
            }

            let subscribers: Vec<Arc<Subscription>> = state
                .subscriptions
                .iter()
                .filter(|s| s.matches(topic))
                .cloned()
                .collect();
            (event, subscribers)
        };

        // Stable sort keeps subscription order inside a priority tier.
        subscribers.sort_by_key(|s| s.priority.rank());
        self.dispatch(&event, &subscribers);
        Ok(event)
    }

    fn dispatch(&self, event: &Event, subscribers: &[Arc<Subscription>]) {
        for sub in subscribers {
            if sub.once_only && sub.claimed.swap(true, Ordering::AcqRel) {
                continue;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(event)))
                .unwrap_or_else(|_| Err(ColonyError::Execution("subscriber panicked".into())));
            match outcome {
                Ok(()) => {
                    if sub.once_only {
                        self.inner.remove_subscription(sub.id);
                    }
                }
                Err(e) => {
                    if sub.once_only {
                        sub.claimed.store(false, Ordering::Release);
                    }
                    self.record_failure(event, sub, e);
                }
            }
        }
    }

    fn record_failure(&self, event: &Event, sub: &Subscription, error: ColonyError) {
        let message = error.to_string();
        warn!(
            topic = %event.topic,
            event_id = %event.id,
            subscription_id = sub.id,
            error = %message,
            "Subscriber failed"
        );
        {
            let mut state = self.inner.state.lock();
            state.failed_deliveries += 1;
            let cap = self.inner.config.dead_letter_capacity;
            if cap > 0 {
                state.dead_letters.push_back(EventDeadLetter {
                    event: event.clone(),
                    subscription_id: sub.id,
                    subscription_topic: sub.topic.clone(),
                    error: message.clone(),
                    failed_at: Utc::now(),
                });
                while state.dead_letters.len() > cap {
                    state.dead_letters.pop_front();
                }
            }
        }
        self.inner.signals.emit(Signal::SubscriptionError {
            topic: event.topic.clone(),
            subscription_id: sub.id,
            event_id: event.id,
            error: message,
        });
    }

    /// Retained events for `topic`, or for every topic when `None` or `*`,
    /// oldest first.
    pub fn get_event_history(&self, topic: Option<&str>) -> Vec<Event> {
        let state = self.inner.state.lock();
        match topic {
            Some(t) if t != WILDCARD_TOPIC => state
                .history
                .get(t)
                .map(|h| h.iter().cloned().collect())
                .unwrap_or_default(),
            _ => state.retained(),
        }
    }

    pub fn query_event_history(&self, query: &EventQuery) -> Vec<Event> {
        let mut matched: Vec<Event> = self
            .inner
            .state
            .lock()
            .retained()
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        if let Some(limit) = query.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    /// Feed retained events for `topic` (or `*`) to `callback`, oldest first.
    ///
    /// Replay does not touch subscribers or counters. Returns the number of
    /// events replayed.
    pub fn replay_events<F>(&self, topic: &str, mut callback: F) -> usize
    where
        F: FnMut(&Event),
    {
        let events = self.get_event_history(Some(topic));
        for event in &events {
            callback(event);
        }
        events.len()
    }

    pub fn clear_history(&self) {
        self.inner.state.lock().history.clear();
    }

    pub fn dead_letter_queue(&self) -> Vec<EventDeadLetter> {
        self.inner.state.lock().dead_letters.iter().cloned().collect()
    }

    /// Empty the dead-letter queue, returning how many entries were dropped.
    pub fn clear_dead_letter_queue(&self) -> usize {
        let mut state = self.inner.state.lock();
        let n = state.dead_letters.len();
        state.dead_letters.clear();
        n
    }

    pub fn get_event_statistics(&self) -> EventStatistics {
        let state = self.inner.state.lock();
        EventStatistics {
            total_published: state.total_published,
            per_topic: state.per_topic.clone(),
            subscriptions: state.subscriptions.len(),
            retained_events: state.history.values().map(VecDeque::len).sum(),
            dead_letters: state.dead_letters.len(),
            failed_deliveries: state.failed_deliveries,
        }
    }

    /// Number of subscriptions that would receive an event published on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.inner.state.lock();
        if topic == WILDCARD_TOPIC {
            return state.subscriptions.len();
        }
        state.subscriptions.iter().filter(|s| s.matches(topic)).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Drop every subscription and reject further publishes. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut state = self.inner.state.lock();
            let n = state.subscriptions.len();
            state.subscriptions.clear();
            n
        };
        info!(subscriptions = dropped, "Event bus stopped");
    }

    fn ensure_running(&self) -> ColonyResult<()> {
        if self.is_stopped() {
            Err(ColonyError::Shutdown("event bus is stopped".into()))
        } else {
            Ok(())
        }
    }
}
