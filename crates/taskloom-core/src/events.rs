//! Priority event bus for inter-component communication.
//!
//! Delivery semantics: higher priority first, FIFO among equal priorities,
//! at-least-once. Subscribers match on exact names, `"prefix.*"` patterns or
//! the universal `"*"`. Failed deliveries are retried with priority demotion
//! and end up on the dead-letter queue once their retry budget is spent.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::broker::StreamBroker;
use crate::error::TaskloomError;
use crate::metrics;

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Unit of pub/sub traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "Event::default_ttl")]
    pub ttl_seconds: i64,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "Event::default_max_retries")]
    pub max_retries: u32,
    /// Backing-stream entry id, set on events pulled from a durable broker.
    #[serde(default)]
    pub ack_id: Option<String>,
}

impl Event {
    const fn default_ttl() -> i64 {
        3600
    }

    const fn default_max_retries() -> u32 {
        3
    }

    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            destination: None,
            payload: empty_object(),
            timestamp: Utc::now(),
            priority: 0,
            ttl_seconds: Self::default_ttl(),
            correlation_id: None,
            retry_count: 0,
            max_retries: Self::default_max_retries(),
            ack_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.timestamp);
        age.num_seconds() > self.ttl_seconds
    }
}

/// Asynchronous event consumer. The registered name participates in
/// destination-targeted routing.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str {
        "anonymous"
    }

    async fn handle(&self, event: Event) -> Result<(), TaskloomError>;
}

type BoxedHandlerFn =
    Box<dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), TaskloomError>> + Send>> + Send + Sync>;

struct FnHandler {
    name: String,
    func: BoxedHandlerFn,
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Event) -> Result<(), TaskloomError> {
        (self.func)(event).await
    }
}

pub type SubscriptionId = u64;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// Heap entry; higher priority first, earlier sequence first among equals.
struct QueuedEvent {
    priority: i32,
    seq: u64,
    event: Event,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;
type EventInterceptor = Box<dyn Fn(Event) -> Event + Send + Sync>;
type EventPredicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Size of the history ring buffer.
    pub max_history: usize,
    /// Bound on the dead-letter queue.
    pub dead_letter_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_history: 10_000,
            dead_letter_capacity: 1_000,
        }
    }
}

/// Point-in-time bus counters for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub events_published: u64,
    pub delivery_errors: u64,
    pub active_subscriptions: usize,
    pub history_size: usize,
    pub dead_letter_size: usize,
    pub queue_size: usize,
}

struct BusInner {
    config: BusConfig,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    queue_notify: Notify,
    history: Mutex<VecDeque<Event>>,
    dead_letters: Mutex<VecDeque<Event>>,
    filters: RwLock<Vec<EventFilter>>,
    interceptors: RwLock<Vec<EventInterceptor>>,
    broker: Option<Arc<dyn StreamBroker>>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    published: AtomicU64,
    delivery_errors: AtomicU64,
}

impl BusInner {
    fn enqueue(&self, event: Event) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let priority = event.priority;
        self.queue
            .lock()
            .expect("bus queue lock")
            .push(QueuedEvent {
                priority,
                seq,
                event,
            });
        self.queue_notify.notify_one();
    }

    fn pop(&self) -> Option<Event> {
        self.queue
            .lock()
            .expect("bus queue lock")
            .pop()
            .map(|q| q.event)
    }

    fn dead_letter(&self, event: Event) {
        metrics::record_dead_letter(&event.event_type);
        let mut dlq = self.dead_letters.lock().expect("dead letter lock");
        if dlq.len() >= self.config.dead_letter_capacity {
            dlq.pop_front();
        }
        dlq.push_back(event);
    }

    fn matching_handlers(&self, event_type: &str) -> Vec<Subscription> {
        let table = self.subscriptions.read().expect("subscription lock");
        let mut handlers = Vec::new();
        for (pattern, subs) in table.iter() {
            if pattern_matches(pattern, event_type) {
                handlers.extend(subs.iter().cloned());
            }
        }
        handlers
    }

    async fn dispatch(&self, mut event: Event) {
        if event.is_expired() {
            tracing::warn!(event_id = %event.event_id, "event expired before dispatch");
            let ack_id = event.ack_id.clone();
            self.dead_letter(event);
            self.ack(ack_id).await;
            return;
        }

        let mut handlers = self.matching_handlers(&event.event_type);
        if let Some(destination) = &event.destination {
            handlers.retain(|sub| sub.handler.name() == destination.as_str());
        }

        if handlers.is_empty() {
            tracing::trace!(event_type = %event.event_type, "no subscribers");
            self.ack(event.ack_id.clone()).await;
            return;
        }

        let mut set = JoinSet::new();
        for sub in handlers {
            let handler = sub.handler.clone();
            let event = event.clone();
            set.spawn(async move { handler.handle(event).await });
        }

        let mut failures = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    tracing::error!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        error = %err,
                        "event handler failed"
                    );
                }
                Err(join_err) => {
                    failures += 1;
                    tracing::error!(
                        event_id = %event.event_id,
                        error = %join_err,
                        "event handler panicked"
                    );
                }
            }
        }

        metrics::record_delivery(&event.event_type, failures == 0);

        if failures > 0 {
            self.delivery_errors
                .fetch_add(failures as u64, Ordering::Relaxed);
            if event.retry_count < event.max_retries {
                event.retry_count += 1;
                event.priority -= 1;
                tracing::info!(
                    event_id = %event.event_id,
                    attempt = event.retry_count,
                    "re-enqueueing event after handler failure"
                );
                self.enqueue(event);
                return;
            }
            tracing::error!(
                event_id = %event.event_id,
                retries = event.retry_count,
                "event moved to dead-letter queue"
            );
            let ack_id = event.ack_id.clone();
            self.dead_letter(event);
            self.ack(ack_id).await;
            return;
        }

        self.ack(event.ack_id.clone()).await;
    }

    async fn ack(&self, ack_id: Option<String>) {
        if let (Some(broker), Some(id)) = (&self.broker, ack_id) {
            if let Err(err) = broker.ack(&id).await {
                tracing::warn!(ack_id = %id, error = %err, "failed to ack event");
            }
        }
    }
}

fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type.starts_with(prefix);
    }
    false
}

/// The bus itself; share it as `Arc<EventBus>`.
pub struct EventBus {
    inner: Arc<BusInner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Durable mode: published events are written to the broker stream and
    /// fed back through the puller, deduplicated by `event_id`.
    pub fn with_broker(config: BusConfig, broker: Arc<dyn StreamBroker>) -> Self {
        Self::build(config, Some(broker))
    }

    fn build(config: BusConfig, broker: Option<Arc<dyn StreamBroker>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                queue_notify: Notify::new(),
                history: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                filters: RwLock::new(Vec::new()),
                interceptors: RwLock::new(Vec::new()),
                broker,
                sequence: AtomicU64::new(0),
                next_subscription: AtomicU64::new(1),
                published: AtomicU64::new(0),
                delivery_errors: AtomicU64::new(0),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the processor task (and the broker puller in durable mode).
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("bus task lock");
        if !tasks.is_empty() {
            return;
        }

        let inner = self.inner.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                let event = loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    if let Some(event) = inner.pop() {
                        break event;
                    }
                    tokio::select! {
                        _ = inner.queue_notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                };
                inner.dispatch(event).await;
            }
        }));

        if let Some(broker) = self.inner.broker.clone() {
            let inner = self.inner.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    match broker.consume(10).await {
                        Ok(events) => {
                            if events.is_empty() {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                continue;
                            }
                            for event in events {
                                match broker.already_processed(&event.event_id).await {
                                    Ok(true) => {
                                        tracing::debug!(
                                            event_id = %event.event_id,
                                            "skipping duplicate event"
                                        );
                                        if let Some(ack_id) = &event.ack_id {
                                            let _ = broker.ack(ack_id).await;
                                        }
                                    }
                                    Ok(false) => inner.enqueue(event),
                                    Err(err) => {
                                        tracing::error!(error = %err, "dedup check failed");
                                        inner.enqueue(event);
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "broker poll error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }));
        }

        tracing::info!(durable = self.inner.broker.is_some(), "event bus started");
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.inner.queue_notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("bus task lock"));
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("event bus stopped");
    }

    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscriptions
            .write()
            .expect("subscription lock")
            .entry(pattern.to_string())
            .or_default()
            .push(Subscription { id, handler });
        tracing::debug!(pattern, id, "subscribed");
        id
    }

    /// Convenience wrapper registering an async closure as a named handler.
    pub fn subscribe_fn<F, Fut>(&self, pattern: &str, name: &str, func: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskloomError>> + Send + 'static,
    {
        let handler = FnHandler {
            name: name.to_string(),
            func: Box::new(move |event| Box::pin(func(event))),
        };
        self.subscribe(pattern, Arc::new(handler))
    }

    /// No-op if the subscription is absent.
    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) {
        let mut table = self.inner.subscriptions.write().expect("subscription lock");
        if let Some(subs) = table.get_mut(pattern) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                table.remove(pattern);
            }
        }
    }

    /// Publish an event; returns its id. In durable mode the event goes to
    /// the backing stream and falls back to the local queue on backend
    /// error, so an accepted publish is never lost.
    pub async fn publish(&self, event: Event) -> Result<String, TaskloomError> {
        let mut event = event;

        for interceptor in self.inner.interceptors.read().expect("interceptor lock").iter() {
            event = interceptor(event);
        }

        for filter in self.inner.filters.read().expect("filter lock").iter() {
            if !filter(&event) {
                tracing::debug!(event_id = %event.event_id, "event filtered out");
                return Ok(event.event_id);
            }
        }

        if event.is_expired() {
            tracing::warn!(event_id = %event.event_id, "event expired before publish");
            let event_id = event.event_id.clone();
            self.inner.dead_letter(event);
            return Ok(event_id);
        }

        let event_id = event.event_id.clone();
        {
            let mut history = self.inner.history.lock().expect("history lock");
            if history.len() >= self.inner.config.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        match &self.inner.broker {
            Some(broker) => {
                if let Err(err) = broker.publish(&event).await {
                    tracing::error!(error = %err, "broker publish failed, using local queue");
                    self.inner.enqueue(event);
                }
            }
            None => self.inner.enqueue(event),
        }

        Ok(event_id)
    }

    /// Request/response: publish with a fresh correlation id and wait for a
    /// `<event_type>.reply` carrying the same id.
    pub async fn publish_and_wait(
        &self,
        mut event: Event,
        timeout: Duration,
    ) -> Result<Option<Event>, TaskloomError> {
        let correlation_id = Uuid::new_v4().to_string();
        event.correlation_id = Some(correlation_id.clone());
        let reply_type = format!("{}.reply", event.event_type);

        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(OneShotWaiter {
            name: "reply_waiter".to_string(),
            accept: Box::new(move |e: &Event| {
                e.correlation_id.as_deref() == Some(correlation_id.as_str())
            }),
            tx: Mutex::new(Some(tx)),
        });
        let sub_id = self.subscribe(&reply_type, waiter);

        self.publish(event).await?;

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            _ => None,
        };
        self.unsubscribe(&reply_type, sub_id);
        Ok(reply)
    }

    /// Wait for the next event matching `pattern` (and predicate, if given).
    pub async fn wait_for_event(
        &self,
        pattern: &str,
        predicate: Option<EventPredicate>,
        timeout: Duration,
    ) -> Option<Event> {
        let (tx, rx) = oneshot::channel();
        let accept: EventPredicate = predicate.unwrap_or_else(|| Box::new(|_| true));
        let waiter = Arc::new(OneShotWaiter {
            name: "event_waiter".to_string(),
            accept,
            tx: Mutex::new(Some(tx)),
        });
        let sub_id = self.subscribe(pattern, waiter);

        let event = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Some(event),
            _ => None,
        };
        self.unsubscribe(pattern, sub_id);
        event
    }

    /// Last `limit` events, optionally restricted to one exact type.
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.inner.history.lock().expect("history lock");
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().expect("history lock").clear();
    }

    /// Republish historical events by id.
    pub async fn replay(&self, event_ids: &[String]) -> Result<usize, TaskloomError> {
        let to_replay: Vec<Event> = {
            let history = self.inner.history.lock().expect("history lock");
            history
                .iter()
                .filter(|e| event_ids.contains(&e.event_id))
                .cloned()
                .collect()
        };

        let count = to_replay.len();
        for event in to_replay {
            tracing::info!(event_id = %event.event_id, "replaying event");
            self.publish(event).await?;
        }
        Ok(count)
    }

    pub fn dead_letters(&self) -> Vec<Event> {
        self.inner
            .dead_letters
            .lock()
            .expect("dead letter lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Re-publish dead letters (all, or a specific id set) with their retry
    /// budget reset.
    pub async fn retry_dead_letters(
        &self,
        event_ids: Option<&[String]>,
    ) -> Result<usize, TaskloomError> {
        let to_retry: Vec<Event> = {
            let mut dlq = self.inner.dead_letters.lock().expect("dead letter lock");
            let mut picked = Vec::new();
            dlq.retain(|event| {
                let matches = event_ids.is_none_or(|ids| ids.contains(&event.event_id));
                if matches {
                    picked.push(event.clone());
                }
                !matches
            });
            picked
        };

        let count = to_retry.len();
        for mut event in to_retry {
            event.retry_count = 0;
            event.ack_id = None;
            self.publish(event).await?;
        }
        Ok(count)
    }

    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.inner
            .filters
            .write()
            .expect("filter lock")
            .push(Box::new(filter));
    }

    pub fn add_interceptor<F>(&self, interceptor: F)
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        self.inner
            .interceptors
            .write()
            .expect("interceptor lock")
            .push(Box::new(interceptor));
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.inner.published.load(Ordering::Relaxed),
            delivery_errors: self.inner.delivery_errors.load(Ordering::Relaxed),
            active_subscriptions: self
                .inner
                .subscriptions
                .read()
                .expect("subscription lock")
                .values()
                .map(|v| v.len())
                .sum(),
            history_size: self.inner.history.lock().expect("history lock").len(),
            dead_letter_size: self.inner.dead_letters.lock().expect("dead letter lock").len(),
            queue_size: self.inner.queue.lock().expect("bus queue lock").len(),
        }
    }
}

struct OneShotWaiter {
    name: String,
    accept: EventPredicate,
    tx: Mutex<Option<oneshot::Sender<Event>>>,
}

#[async_trait]
impl EventHandler for OneShotWaiter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Event) -> Result<(), TaskloomError> {
        if (self.accept)(&event) {
            if let Some(tx) = self.tx.lock().expect("waiter lock").take() {
                let _ = tx.send(event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        name: String,
        seen: Mutex<Vec<Event>>,
        fail_times: AtomicUsize,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
                fail_times: AtomicUsize::new(0),
            })
        }

        fn failing(name: &str, times: usize) -> Arc<Self> {
            let recorder = Self::new(name);
            recorder.fail_times.store(times, Ordering::SeqCst);
            recorder
        }

        fn types(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.event_type.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, event: Event) -> Result<(), TaskloomError> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(TaskloomError::Bus("induced failure".to_string()));
            }
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[test]
    fn pattern_matching() {
        assert!(pattern_matches("task.started", "task.started"));
        assert!(pattern_matches("task.*", "task.started"));
        assert!(pattern_matches("*", "anything.at.all"));
        assert!(!pattern_matches("task.*", "graph.started"));
        assert!(!pattern_matches("task.started", "task.completed"));
    }

    #[tokio::test]
    async fn wildcard_subscription_with_priority_order() {
        let bus = EventBus::new(BusConfig::default());
        let recorder = Recorder::new("h");
        bus.subscribe("task.*", recorder.clone());

        // Publish before starting the processor so the heap orders them.
        bus.publish(Event::new("task.started", "test").with_priority(1))
            .await
            .unwrap();
        bus.publish(Event::new("task.completed", "test").with_priority(10))
            .await
            .unwrap();
        bus.publish(Event::new("other.event", "test").with_priority(5))
            .await
            .unwrap();

        bus.start();
        settle().await;

        assert_eq!(recorder.types(), vec!["task.completed", "task.started"]);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn equal_priority_preserves_publish_order() {
        let bus = EventBus::new(BusConfig::default());
        let recorder = Recorder::new("h");
        bus.subscribe("seq.*", recorder.clone());

        for i in 0..5 {
            bus.publish(Event::new(format!("seq.{i}"), "test"))
                .await
                .unwrap();
        }
        bus.start();
        settle().await;

        assert_eq!(
            recorder.types(),
            vec!["seq.0", "seq.1", "seq.2", "seq.3", "seq.4"]
        );
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn destination_filters_handlers() {
        let bus = EventBus::new(BusConfig::default());
        let intended = Recorder::new("intended");
        let bystander = Recorder::new("bystander");
        bus.subscribe("targeted.event", intended.clone());
        bus.subscribe("targeted.event", bystander.clone());
        bus.start();

        bus.publish(Event::new("targeted.event", "test").with_destination("intended"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(intended.types().len(), 1);
        assert!(bystander.types().is_empty());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn failing_handler_retries_then_dead_letters() {
        let bus = EventBus::new(BusConfig::default());
        let recorder = Recorder::failing("h", 10);
        bus.subscribe("doomed.event", recorder.clone());
        bus.start();

        let mut event = Event::new("doomed.event", "test");
        event.max_retries = 2;
        let event_id = event.event_id.clone();
        bus.publish(event).await.unwrap();
        settle().await;

        let dlq = bus.dead_letters();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].event_id, event_id);
        assert_eq!(dlq[0].retry_count, 2);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn dead_letter_retry_preserves_identity() {
        let bus = EventBus::new(BusConfig::default());
        // Fails exactly through the retry budget, then succeeds on replay.
        let recorder = Recorder::failing("h", 3);
        bus.subscribe("flaky.event", recorder.clone());
        bus.start();

        let mut event = Event::new("flaky.event", "test").with_payload(
            serde_json::json!({"k": "v"}),
        );
        event.max_retries = 2;
        let event_id = event.event_id.clone();
        bus.publish(event).await.unwrap();
        settle().await;
        assert_eq!(bus.dead_letters().len(), 1);

        bus.retry_dead_letters(None).await.unwrap();
        settle().await;

        assert!(bus.dead_letters().is_empty());
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_id, event_id);
        assert_eq!(seen[0].payload["k"], "v");
    }

    #[tokio::test]
    async fn expired_events_are_dead_lettered() {
        let bus = EventBus::new(BusConfig::default());
        let recorder = Recorder::new("h");
        bus.subscribe("stale.event", recorder.clone());
        bus.start();

        let mut event = Event::new("stale.event", "test");
        event.timestamp = Utc::now() - chrono::Duration::seconds(7200);
        bus.publish(event).await.unwrap();
        settle().await;

        assert!(recorder.types().is_empty());
        assert_eq!(bus.dead_letters().len(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn publish_and_wait_round_trip() {
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let replier_bus = bus.clone();
        bus.subscribe_fn("ping", "replier", move |event| {
            let bus = replier_bus.clone();
            async move {
                let reply = Event::new("ping.reply", "replier")
                    .with_payload(serde_json::json!({"pong": true}))
                    .with_correlation_id(event.correlation_id.unwrap_or_default());
                bus.publish(reply).await?;
                Ok(())
            }
        });
        bus.start();

        let reply = bus
            .publish_and_wait(Event::new("ping", "test"), Duration::from_secs(2))
            .await
            .unwrap();

        let reply = reply.expect("reply should arrive");
        assert_eq!(reply.event_type, "ping.reply");
        assert_eq!(reply.payload["pong"], true);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn publish_and_wait_times_out_without_reply() {
        let bus = EventBus::new(BusConfig::default());
        bus.start();

        let reply = bus
            .publish_and_wait(Event::new("silence", "test"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(reply.is_none());
        // The temporary subscription is detached on timeout.
        assert_eq!(bus.stats().active_subscriptions, 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn filters_drop_and_interceptors_mutate() {
        let bus = EventBus::new(BusConfig::default());
        let recorder = Recorder::new("h");
        bus.subscribe("filtered.*", recorder.clone());
        bus.add_filter(|event| event.event_type != "filtered.drop");
        bus.add_interceptor(|mut event| {
            event.payload = serde_json::json!({"stamped": true});
            event
        });
        bus.start();

        bus.publish(Event::new("filtered.drop", "test")).await.unwrap();
        bus.publish(Event::new("filtered.keep", "test")).await.unwrap();
        settle().await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, "filtered.keep");
        assert_eq!(seen[0].payload["stamped"], true);
    }

    #[tokio::test]
    async fn history_is_bounded_and_filterable() {
        let bus = EventBus::new(BusConfig {
            max_history: 5,
            dead_letter_capacity: 10,
        });
        bus.start();

        for i in 0..8 {
            bus.publish(Event::new(format!("hist.{}", i % 2), "test"))
                .await
                .unwrap();
        }
        settle().await;

        assert_eq!(bus.history(None, 100).len(), 5);
        let only_zero = bus.history(Some("hist.0"), 100);
        assert!(only_zero.iter().all(|e| e.event_type == "hist.0"));
        bus.shutdown().await;
    }
}
