use crate::message::{AgentMessage, BroadcastMessage, MessagePriority, OutgoingMessage};
use convoy_core::{generate_id, BoundedLog, Clock, ConvoyResult, EventEmitter, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Event raised for every successfully delivered message, after the type-named event.
pub const MESSAGE_DELIVERED: &str = "message_delivered";
/// Event raised when a message is dropped for good after a failed delivery.
pub const MESSAGE_FAILED: &str = "message_failed";

/// Tunables for the [`MessageBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum number of messages kept in the full message log.
    #[serde(default = "default_max_log_size")]
    pub max_log_size: usize,
    /// Urgent redeliveries are dropped once the live queue holds this many items.
    #[serde(default = "default_urgent_queue_limit")]
    pub urgent_queue_limit: usize,
    /// Maximum redeliveries of one urgent message.
    #[serde(default = "default_urgent_retry_limit")]
    pub urgent_retry_limit: u32,
    /// Period of the background log cleanup while the bus is started.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Log entries older than this are purged by the background cleanup.
    #[serde(default = "default_message_max_age_secs")]
    pub message_max_age_secs: u64,
}

fn default_max_log_size() -> usize {
    1000
}
fn default_urgent_queue_limit() -> usize {
    100
}
fn default_urgent_retry_limit() -> u32 {
    3
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_message_max_age_secs() -> u64 {
    3600
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_log_size: default_max_log_size(),
            urgent_queue_limit: default_urgent_queue_limit(),
            urgent_retry_limit: default_urgent_retry_limit(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            message_max_age_secs: default_message_max_age_secs(),
        }
    }
}

/// Serializable snapshot of bus activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStats {
    /// Messages in the full message log.
    pub total_messages: usize,
    /// Messages waiting for delivery.
    pub queue_size: usize,
    /// Registered subscribers.
    pub subscribers: usize,
    /// Whether the drain loop is active.
    pub processing: bool,
    /// Successful deliveries since creation.
    pub delivered: u64,
    /// Messages skipped by a subscription filter.
    pub filtered: u64,
    /// No subscriber for the recipient, or an urgent redelivery refused on a full queue.
    pub dropped: u64,
    /// Deliveries that failed for good.
    pub failed: u64,
    /// Urgent redeliveries.
    pub retried: u64,
    /// Log entries per message type.
    pub messages_by_type: HashMap<String, usize>,
}

struct Queued {
    message: AgentMessage,
    attempts: u32,
}

#[derive(Default)]
struct Counters {
    delivered: u64,
    filtered: u64,
    dropped: u64,
    failed: u64,
    retried: u64,
}

struct BusState {
    queue: VecDeque<Queued>,
    log: BoundedLog<AgentMessage>,
    subscriptions: BTreeMap<String, HashSet<String>>,
    processing: bool,
    counters: Counters,
}

struct BusInner {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BusState>,
    events: EventEmitter<AgentMessage>,
    idle: Notify,
    running: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

/// Point-to-point and broadcast pub/sub between named agents.
///
/// `send` only enqueues. A single drain loop pops messages in FIFO order and
/// raises a type-named event plus [`MESSAGE_DELIVERED`] for each message whose
/// recipient accepts its type. Sends issued while the loop is active (including
/// from inside event handlers) are picked up by the same loop.
///
/// Cloning the bus yields another handle to the same queue.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// A bus on the system clock.
    pub fn new(config: BusConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a bus whose message timestamps and cleanup use `clock`.
    pub fn with_clock(config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        let log = BoundedLog::new(config.max_log_size);
        Self {
            inner: Arc::new(BusInner {
                config,
                clock,
                state: Mutex::new(BusState {
                    queue: VecDeque::new(),
                    log,
                    subscriptions: BTreeMap::new(),
                    processing: false,
                    counters: Counters::default(),
                }),
                events: EventEmitter::new(),
                idle: Notify::new(),
                running: AtomicBool::new(false),
                cleanup_task: Mutex::new(None),
            }),
        }
    }

    /// Register an observer for a message type or for [`MESSAGE_DELIVERED`] /
    /// [`MESSAGE_FAILED`]. A handler error counts as a delivery failure.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&AgentMessage) -> ConvoyResult<()> + Send + Sync + 'static,
    {
        self.inner.events.on(event, handler);
    }

    /// Enqueue a message and return its id. Never waits for delivery.
    pub fn send(&self, message: OutgoingMessage) -> String {
        let id = generate_id("msg");
        let message = message.stamp(id.clone(), self.inner.clock.now());
        debug!(
            message_id = %id,
            from = %message.from,
            to = %message.to,
            message_type = %message.message_type,
            "Message queued"
        );

        let start_drain = {
            let mut state = self.inner.state.lock();
            state.log.push(message.clone());
            state.queue.push_back(Queued {
                message,
                attempts: 0,
            });
            let idle = !state.processing;
            state.processing = true;
            idle
        };

        if start_drain {
            self.spawn_drain();
        }
        id
    }

    /// Send one copy of `message` to every currently subscribed agent.
    pub fn broadcast(&self, message: BroadcastMessage) -> Vec<String> {
        let recipients: Vec<String> = self.inner.state.lock().subscriptions.keys().cloned().collect();
        debug!(
            from = %message.from,
            message_type = %message.message_type,
            recipients = recipients.len(),
            "Broadcasting message"
        );
        recipients
            .into_iter()
            .map(|agent| self.send(message.addressed_to(agent)))
            .collect()
    }

    /// Accept `types` for `agent_id`. An empty filter accepts every type.
    pub fn subscribe<I, S>(&self, agent_id: impl Into<String>, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent_id = agent_id.into();
        let mut state = self.inner.state.lock();
        let filter = state.subscriptions.entry(agent_id.clone()).or_default();
        filter.extend(types.into_iter().map(Into::into));
        info!(agent_id = %agent_id, types = filter.len(), "Agent subscribed");
    }

    /// Stop accepting `types` for `agent_id`. An empty list removes the agent.
    ///
    /// Removing the last type also removes the agent rather than widening its
    /// filter to "accept all". Returns whether the subscription changed.
    pub fn unsubscribe<I, S>(&self, agent_id: &str, types: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        let mut state = self.inner.state.lock();
        if types.is_empty() {
            let removed = state.subscriptions.remove(agent_id).is_some();
            if removed {
                info!(agent_id = %agent_id, "Agent unsubscribed");
            }
            return removed;
        }
        let Some(filter) = state.subscriptions.get_mut(agent_id) else {
            return false;
        };
        let before = filter.len();
        for t in &types {
            filter.remove(t);
        }
        let changed = filter.len() != before;
        if filter.is_empty() {
            state.subscriptions.remove(agent_id);
            info!(agent_id = %agent_id, "Agent unsubscribed");
        }
        changed
    }

    /// Whether `agent_id` has a subscription.
    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.inner.state.lock().subscriptions.contains_key(agent_id)
    }

    /// Ids of every subscribed agent, sorted.
    pub fn subscribers(&self) -> Vec<String> {
        self.inner.state.lock().subscriptions.keys().cloned().collect()
    }

    /// Purge log entries older than `max_age`. The live queue is untouched.
    pub fn cleanup_old_messages(&self, max_age: Duration) -> usize {
        let cutoff = self.inner.clock.now() - chrono::Duration::milliseconds(max_age.as_millis() as i64);
        let removed = self.inner.state.lock().log.retain(|m| m.timestamp >= cutoff);
        if removed > 0 {
            info!(removed, "Cleaned up old messages");
        }
        removed
    }

    /// Logged messages sent by or to `agent_id` (all messages when `None`),
    /// newest `limit` entries, oldest first.
    pub fn get_message_history(&self, agent_id: Option<&str>, limit: usize) -> Vec<AgentMessage> {
        let state = self.inner.state.lock();
        let matching: Vec<&AgentMessage> = state
            .log
            .iter()
            .filter(|m| agent_id.map_or(true, |a| m.from == a || m.to == a))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Counters and queue state.
    pub fn get_message_stats(&self) -> MessageStats {
        let state = self.inner.state.lock();
        let mut messages_by_type: HashMap<String, usize> = HashMap::new();
        for m in state.log.iter() {
            *messages_by_type.entry(m.message_type.clone()).or_default() += 1;
        }
        MessageStats {
            total_messages: state.log.len(),
            queue_size: state.queue.len(),
            subscribers: state.subscriptions.len(),
            processing: state.processing,
            delivered: state.counters.delivered,
            filtered: state.counters.filtered,
            dropped: state.counters.dropped,
            failed: state.counters.failed,
            retried: state.counters.retried,
            messages_by_type,
        }
    }

    /// Wait until the delivery queue is empty and the drain loop is idle.
    pub async fn flush(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock();
                if !state.processing && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Whether the cleanup loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start periodic log cleanup. Delivery itself does not require `start`.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = self.clone();
        let period = Duration::from_secs(self.inner.config.cleanup_interval_secs.max(1));
        let max_age = Duration::from_secs(self.inner.config.message_max_age_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !bus.is_running() {
                    continue;
                }
                bus.cleanup_old_messages(max_age);
            }
        });
        *self.inner.cleanup_task.lock() = Some(handle);
        info!("Message bus started");
    }

    /// Stop the cleanup loop and wait for queued messages to drain.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.cleanup_task.lock().take() {
            handle.abort();
        }
        self.flush().await;
        info!("Message bus stopped");
    }

    // --- Delivery ---

    fn spawn_drain(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = self.clone();
                handle.spawn(async move {
                    while bus.deliver_next() {
                        tokio::task::yield_now().await;
                    }
                });
            }
            // Outside a runtime there is nobody to hand the loop to.
            Err(_) => while self.deliver_next() {},
        }
    }

    /// Deliver the head of the queue. Returns `false` once the queue is empty,
    /// leaving the drain loop idle.
    fn deliver_next(&self) -> bool {
        let next = {
            let mut state = self.inner.state.lock();
            match state.queue.pop_front() {
                Some(q) => q,
                None => {
                    state.processing = false;
                    drop(state);
                    self.inner.idle.notify_waiters();
                    return false;
                }
            }
        };
        self.deliver(next);
        true
    }

    fn deliver(&self, queued: Queued) {
        let message = &queued.message;
        let accepted = {
            let mut state = self.inner.state.lock();
            match state.subscriptions.get(&message.to) {
                None => {
                    state.counters.dropped += 1;
                    None
                }
                Some(filter) if !filter.is_empty() && !filter.contains(&message.message_type) => {
                    state.counters.filtered += 1;
                    Some(false)
                }
                Some(_) => Some(true),
            }
        };

        match accepted {
            None => {
                warn!(message_id = %message.id, to = %message.to, "No subscriber for recipient, dropping message");
                return;
            }
            Some(false) => {
                debug!(
                    message_id = %message.id,
                    to = %message.to,
                    message_type = %message.message_type,
                    "Recipient does not accept message type"
                );
                return;
            }
            Some(true) => {}
        }

        let outcome = self
            .inner
            .events
            .emit(&message.message_type, message)
            .and_then(|_| self.inner.events.emit(MESSAGE_DELIVERED, message));

        match outcome {
            Ok(_) => {
                self.inner.state.lock().counters.delivered += 1;
                debug!(message_id = %message.id, to = %message.to, "Message delivered");
            }
            Err(e) => self.handle_failure(queued, e.to_string()),
        }
    }

    fn handle_failure(&self, mut queued: Queued, reason: String) {
        let message_id = queued.message.id.clone();
        if queued.message.priority == MessagePriority::Urgent {
            let mut state = self.inner.state.lock();
            if queued.attempts >= self.inner.config.urgent_retry_limit {
                state.counters.failed += 1;
                drop(state);
                error!(message_id = %message_id, attempts = queued.attempts + 1, error = %reason, "Urgent message exhausted redeliveries");
            } else if state.queue.len() >= self.inner.config.urgent_queue_limit {
                state.counters.dropped += 1;
                drop(state);
                warn!(message_id = %message_id, error = %reason, "Queue full, dropping urgent redelivery");
            } else {
                queued.attempts += 1;
                state.counters.retried += 1;
                let attempt = queued.attempts;
                state.queue.push_front(queued);
                drop(state);
                warn!(message_id = %message_id, attempt, error = %reason, "Urgent message re-queued");
                return;
            }
        } else {
            self.inner.state.lock().counters.failed += 1;
            error!(message_id = %message_id, error = %reason, "Message delivery failed");
        }
        self.inner.events.emit_quiet(MESSAGE_FAILED, &queued.message);
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoy_core::{ConvoyError, ManualClock};
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn counter(bus: &MessageBus, event: &str) -> Arc<PlMutex<Vec<String>>> {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let s = seen.clone();
        bus.on(event, move |m: &AgentMessage| {
            s.lock().push(m.id.clone());
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn test_send_delivers_to_subscriber() {
        let bus = MessageBus::default();
        bus.subscribe("agent-a", Vec::<String>::new());
        let delivered = counter(&bus, MESSAGE_DELIVERED);

        let id = bus.send(OutgoingMessage::new("x", "agent-a", "ping", json!(1)));
        bus.flush().await;

        assert_eq!(*delivered.lock(), vec![id]);
        assert_eq!(bus.get_message_stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let bus = MessageBus::default();
        bus.subscribe("agent-a", ["T1"]);
        let delivered = counter(&bus, MESSAGE_DELIVERED);
        let t1 = counter(&bus, "T1");
        let t2 = counter(&bus, "T2");

        bus.send(OutgoingMessage::new("x", "agent-a", "T2", json!(null)));
        bus.flush().await;
        assert!(delivered.lock().is_empty());
        assert!(t2.lock().is_empty());

        bus.send(OutgoingMessage::new("x", "agent-a", "T1", json!(null)));
        bus.flush().await;
        assert_eq!(delivered.lock().len(), 1);
        assert_eq!(t1.lock().len(), 1);
        assert_eq!(bus.get_message_stats().filtered, 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_dropped() {
        let bus = MessageBus::default();
        let delivered = counter(&bus, MESSAGE_DELIVERED);
        bus.send(OutgoingMessage::new("x", "ghost", "ping", json!(null)));
        bus.flush().await;
        assert!(delivered.lock().is_empty());
        assert_eq!(bus.get_message_stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_broadcast_fans_out() {
        let bus = MessageBus::default();
        for a in ["a1", "a2", "a3"] {
            bus.subscribe(a, Vec::<String>::new());
        }
        let ids = bus.broadcast(BroadcastMessage::new("coord", "status", json!({})));
        bus.flush().await;

        assert_eq!(ids.len(), 3);
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 3);
        let history = bus.get_message_history(None, 10);
        let mut recipients: Vec<&str> = history.iter().map(|m| m.to.as_str()).collect();
        recipients.sort_unstable();
        assert_eq!(recipients, vec!["a1", "a2", "a3"]);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let bus = MessageBus::default();
        bus.subscribe("a", Vec::<String>::new());
        let delivered = counter(&bus, MESSAGE_DELIVERED);
        let ids: Vec<String> = (0..10)
            .map(|i| bus.send(OutgoingMessage::new("x", "a", "n", json!(i))))
            .collect();
        bus.flush().await;
        assert_eq!(*delivered.lock(), ids);
    }

    #[tokio::test]
    async fn test_send_from_handler_does_not_reenter() {
        let bus = MessageBus::default();
        bus.subscribe("a", Vec::<String>::new());
        bus.subscribe("b", Vec::<String>::new());
        let order = Arc::new(PlMutex::new(Vec::new()));

        let relay = bus.clone();
        let o = order.clone();
        bus.on("first", move |m: &AgentMessage| {
            o.lock().push(format!("first->{}", m.to));
            relay.send(OutgoingMessage::new("a", "b", "second", json!(null)));
            Ok(())
        });
        let o = order.clone();
        bus.on("second", move |m: &AgentMessage| {
            o.lock().push(format!("second->{}", m.to));
            Ok(())
        });
        let o = order.clone();
        bus.on("third", move |m: &AgentMessage| {
            o.lock().push(format!("third->{}", m.to));
            Ok(())
        });

        bus.send(OutgoingMessage::new("x", "a", "first", json!(null)));
        bus.send(OutgoingMessage::new("x", "a", "third", json!(null)));
        bus.flush().await;

        // The relayed message is queued behind "third", not delivered inline.
        assert_eq!(*order.lock(), vec!["first->a", "third->a", "second->b"]);
    }

    #[tokio::test]
    async fn test_urgent_failure_is_retried() {
        let bus = MessageBus::default();
        bus.subscribe("a", Vec::<String>::new());
        let attempts = Arc::new(PlMutex::new(0u32));
        let a = attempts.clone();
        bus.on("flaky", move |_: &AgentMessage| {
            let mut n = a.lock();
            *n += 1;
            if *n < 3 {
                Err(ConvoyError::Bus("not yet".into()))
            } else {
                Ok(())
            }
        });
        bus.send(
            OutgoingMessage::new("x", "a", "flaky", json!(null)).with_priority(MessagePriority::Urgent),
        );
        bus.flush().await;

        assert_eq!(*attempts.lock(), 3);
        let stats = bus.get_message_stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_urgent_retries_are_capped() {
        let bus = MessageBus::default();
        bus.subscribe("a", Vec::<String>::new());
        let attempts = Arc::new(PlMutex::new(0u32));
        let a = attempts.clone();
        bus.on("broken", move |_: &AgentMessage| {
            *a.lock() += 1;
            Err(ConvoyError::Bus("down".into()))
        });
        let failed = counter(&bus, MESSAGE_FAILED);
        bus.send(
            OutgoingMessage::new("x", "a", "broken", json!(null)).with_priority(MessagePriority::Urgent),
        );
        bus.flush().await;

        assert_eq!(*attempts.lock(), 1 + default_urgent_retry_limit());
        assert_eq!(failed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_urgent_redelivery_dropped_when_queue_full() {
        let bus = MessageBus::new(BusConfig {
            urgent_queue_limit: 1,
            ..BusConfig::default()
        });
        bus.subscribe("a", Vec::<String>::new());
        let attempts = Arc::new(PlMutex::new(0u32));
        let a = attempts.clone();
        let sender = bus.clone();
        bus.on("alarm", move |_: &AgentMessage| {
            *a.lock() += 1;
            // fills the queue before the failure is handled
            sender.send(OutgoingMessage::new("x", "a", "follow-up", json!(null)));
            Err(ConvoyError::Bus("down".into()))
        });
        let failed = counter(&bus, MESSAGE_FAILED);
        let delivered = counter(&bus, MESSAGE_DELIVERED);

        let id = bus.send(
            OutgoingMessage::new("x", "a", "alarm", json!(null)).with_priority(MessagePriority::Urgent),
        );
        bus.flush().await;

        assert_eq!(*attempts.lock(), 1);
        assert_eq!(*failed.lock(), vec![id]);
        assert_eq!(delivered.lock().len(), 1);
        let stats = bus.get_message_stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.retried, 0);
    }

    #[tokio::test]
    async fn test_normal_failure_is_not_retried() {
        let bus = MessageBus::default();
        bus.subscribe("a", Vec::<String>::new());
        let attempts = Arc::new(PlMutex::new(0u32));
        let a = attempts.clone();
        bus.on("broken", move |_: &AgentMessage| {
            *a.lock() += 1;
            Err(ConvoyError::Bus("down".into()))
        });
        bus.send(OutgoingMessage::new("x", "a", "broken", json!(null)));
        bus.flush().await;
        assert_eq!(*attempts.lock(), 1);
        assert_eq!(bus.get_message_stats().failed, 1);
    }

    #[test]
    fn test_unsubscribe_semantics() {
        let bus = MessageBus::default();
        bus.subscribe("a", ["T1", "T2"]);
        assert!(bus.unsubscribe("a", ["T1"]));
        assert!(bus.is_subscribed("a"));
        assert!(bus.unsubscribe("a", ["T2"]));
        assert!(!bus.is_subscribed("a"));

        bus.subscribe("b", ["T1"]);
        assert!(bus.unsubscribe("b", Vec::<String>::new()));
        assert!(!bus.unsubscribe("b", Vec::<String>::new()));
    }

    #[test]
    fn test_send_outside_runtime_drains_inline() {
        let bus = MessageBus::default();
        bus.subscribe("a", Vec::<String>::new());
        bus.send(OutgoingMessage::new("x", "a", "ping", json!(null)));
        let stats = bus.get_message_stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.queue_size, 0);
        assert!(!stats.processing);
    }

    #[test]
    fn test_cleanup_old_messages() {
        let clock = ManualClock::starting_now();
        let bus = MessageBus::with_clock(BusConfig::default(), Arc::new(clock.clone()));
        bus.send(OutgoingMessage::new("x", "nobody", "old", json!(null)));
        clock.advance(Duration::from_secs(120));
        bus.send(OutgoingMessage::new("x", "nobody", "new", json!(null)));

        assert_eq!(bus.cleanup_old_messages(Duration::from_secs(60)), 1);
        let history = bus.get_message_history(None, 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_type, "new");
    }

    #[test]
    fn test_log_is_bounded() {
        let bus = MessageBus::new(BusConfig {
            max_log_size: 5,
            ..BusConfig::default()
        });
        for i in 0..8 {
            bus.send(OutgoingMessage::new("x", "nobody", "n", json!(i)));
        }
        let history = bus.get_message_history(None, 100);
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].payload, json!(3));
    }

    #[test]
    fn test_history_filtered_by_agent() {
        let bus = MessageBus::default();
        bus.send(OutgoingMessage::new("a", "b", "n", json!(null)));
        bus.send(OutgoingMessage::new("c", "d", "n", json!(null)));
        bus.send(OutgoingMessage::new("b", "a", "n", json!(null)));
        assert_eq!(bus.get_message_history(Some("a"), 10).len(), 2);
        assert_eq!(bus.get_message_history(Some("a"), 1).len(), 1);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let bus = MessageBus::default();
        bus.start();
        assert!(bus.is_running());
        bus.subscribe("a", Vec::<String>::new());
        bus.send(OutgoingMessage::new("x", "a", "n", json!(null)));
        bus.stop().await;
        assert!(!bus.is_running());
        assert_eq!(bus.get_message_stats().queue_size, 0);
    }
}
