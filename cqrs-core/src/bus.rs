//! The event bus (C8): per-type and all-event subscriptions, sync/async
//! publish with retry/timeout hints, and rolling metrics.
//!
//! Handlers operate on the canonical stored-event shape, the same
//! type-erasure boundary used by the dispatchers and the serializer: the
//! bus fans out events a repository has already durably appended, after
//! they have been reduced to [`EventRecord`].
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::instrument;

use crate::error::{new_id, Error, ErrorCode, Result};
use crate::event::EventPriority;
use crate::serialization::EventRecord;

/// Handles one published event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes `event`. An error is surfaced to a sync publisher and
    /// counted (but not propagated) for an async one.
    async fn handle(&self, event: &EventRecord) -> Result<()>;
}

/// Backoff shape between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay between every attempt.
    Fixed,
    /// Delay doubles after every attempt.
    Exponential,
    /// Delay grows by the base delay after every attempt.
    Linear,
}

/// A retry policy applied to each handler invocation during a sync publish.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// How `delay` grows across attempts.
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Linear => self.delay * attempt,
            BackoffStrategy::Exponential => self.delay.saturating_mul(1u32 << attempt.min(16)),
        }
    }
}

/// Options governing a single [`EventBus::publish`] call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Hints the event should be durably stored before fan-out (the core
    /// does not itself persist; this is a marker for host-level bus
    /// implementations that combine storage and dispatch).
    pub persistent: bool,
    /// Hints handlers should run with no batching/debouncing.
    pub immediate: bool,
    /// Runs fan-out on a spawned task and returns immediately. Handler
    /// errors are counted in metrics but never returned to the caller.
    pub r#async: bool,
    /// Retries each handler invocation on failure.
    pub retry: Option<RetryPolicy>,
    /// Caps the total time spent fanning out to all handlers.
    pub timeout: Option<Duration>,
    /// A hint for host-level priority scheduling; not interpreted here.
    pub priority: Option<EventPriority>,
    /// A hint for host-level partitioned delivery; not interpreted here.
    pub partition_key: Option<String>,
}

/// Rolling counters for a bus instance.
#[derive(Debug, Clone, Default)]
pub struct BusMetrics {
    /// Total events submitted to [`EventBus::publish`].
    pub published: u64,
    /// Total events that completed fan-out (success or failure).
    pub processed: u64,
    /// Total handler invocations that returned an error.
    pub failed: u64,
    /// Current number of registered subscriptions (type-specific + all).
    pub active_subscribers: usize,
    /// Exponentially-weighted moving average fan-out latency, in milliseconds.
    pub avg_latency_ms: f64,
    /// Timestamp of the most recently published event.
    pub last_event_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct Subscription {
    id: String,
    handler: Arc<dyn EventHandler>,
}

enum SubscriptionLocation {
    Typed(String),
    All,
}

/// An in-process publish/subscribe fan-out for persisted events.
#[derive(Clone)]
pub struct EventBus {
    by_type: Arc<DashMap<String, Vec<Subscription>>>,
    all: Arc<RwLock<Vec<Subscription>>>,
    locations: Arc<DashMap<String, SubscriptionLocation>>,
    running: Arc<AtomicBool>,
    metrics: Arc<RwLock<BusMetrics>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            by_type: Arc::new(DashMap::new()),
            all: Arc::new(RwLock::new(Vec::new())),
            locations: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(RwLock::new(BusMetrics::default())),
        }
    }
}

impl EventBus {
    /// Creates an empty, stopped bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to events of `event_type`, returning an opaque
    /// subscription id usable with [`unsubscribe`][Self::unsubscribe].
    ///
    /// # Errors
    /// Returns [`ErrorCode::EventBusError`] if `event_type` is empty.
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Result<String> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(Error::new(ErrorCode::EventBusError, "event_type must not be empty"));
        }
        let id = new_id();
        self.by_type.entry(event_type.clone()).or_default().push(Subscription {
            id: id.clone(),
            handler,
        });
        self.locations.insert(id.clone(), SubscriptionLocation::Typed(event_type));
        self.bump_active_subscribers();
        Ok(id)
    }

    /// Subscribes `handler` to every published event, invoked after all
    /// type-specific handlers. Returns an opaque subscription id.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Result<String> {
        let id = new_id();
        self.all.write().push(Subscription {
            id: id.clone(),
            handler,
        });
        self.locations.insert(id.clone(), SubscriptionLocation::All);
        self.bump_active_subscribers();
        Ok(id)
    }

    /// Removes a subscription previously returned by [`subscribe`][Self::subscribe]
    /// or [`subscribe_all`][Self::subscribe_all]. A no-op if `id` is unknown.
    pub fn unsubscribe(&self, id: &str) {
        if let Some((_, location)) = self.locations.remove(id) {
            match location {
                SubscriptionLocation::Typed(event_type) => {
                    if let Some(mut subs) = self.by_type.get_mut(&event_type) {
                        subs.retain(|s| s.id != id);
                    }
                }
                SubscriptionLocation::All => {
                    self.all.write().retain(|s| s.id != id);
                }
            }
            let mut metrics = self.metrics.write();
            metrics.active_subscribers = metrics.active_subscribers.saturating_sub(1);
        }
    }

    fn bump_active_subscribers(&self) {
        self.metrics.write().active_subscribers += 1;
    }

    /// Marks the bus running.
    ///
    /// # Errors
    /// Returns [`ErrorCode::EventBusError`] if already running.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::new(ErrorCode::EventBusError, "event bus is already running"));
        }
        Ok(())
    }

    /// Marks the bus stopped.
    ///
    /// # Errors
    /// Returns [`ErrorCode::EventBusError`] if already stopped.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::new(ErrorCode::EventBusError, "event bus is already stopped"));
        }
        Ok(())
    }

    /// Returns whether [`start`][Self::start] has been called without a
    /// matching [`stop`][Self::stop].
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of the current metrics.
    #[must_use]
    pub fn metrics(&self) -> BusMetrics {
        self.metrics.read().clone()
    }

    fn ordered_handlers(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut handlers: Vec<Arc<dyn EventHandler>> = self
            .by_type
            .get(event_type)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();
        handlers.extend(self.all.read().iter().map(|s| s.handler.clone()));
        handlers
    }

    /// Publishes `event` to its subscribers, honoring `opts`.
    ///
    /// With [`PublishOptions::r#async`] set, fan-out runs on a spawned task
    /// and this returns immediately with handler errors only visible via
    /// [`metrics`][Self::metrics]. Otherwise this blocks until every
    /// handler has run and returns the first handler error, if any.
    #[instrument(skip(self, event, opts), fields(event_type = %event.event_type()))]
    pub async fn publish(&self, event: EventRecord, opts: Option<PublishOptions>) -> Result<()> {
        let opts = opts.unwrap_or_default();
        if opts.r#async {
            let bus = self.clone();
            tokio::spawn(async move {
                let _ = bus.publish_sync(event, opts).await;
            });
            return Ok(());
        }
        self.publish_sync(event, opts).await
    }

    /// Publishes a sequence of events, one at a time; the first failure
    /// short-circuits the remainder.
    pub async fn publish_batch(&self, events: Vec<EventRecord>, opts: Option<PublishOptions>) -> Result<()> {
        for event in events {
            self.publish(event, opts.clone()).await?;
        }
        Ok(())
    }

    async fn publish_sync(&self, event: EventRecord, opts: PublishOptions) -> Result<()> {
        let fan_out = self.fan_out(&event, &opts);
        let result = match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fan_out)
                .await
                .unwrap_or_else(|_| Err(Error::new(ErrorCode::EventBusError, "publish timed out"))),
            None => fan_out.await,
        };

        let mut metrics = self.metrics.write();
        metrics.published += 1;
        metrics.processed += 1;
        metrics.last_event_time = Some(Utc::now());
        result
    }

    async fn fan_out(&self, event: &EventRecord, opts: &PublishOptions) -> Result<()> {
        let started = Instant::now();
        let handlers = self.ordered_handlers(event.event_type());

        let mut first_error = None;
        for handler in handlers {
            if let Err(error) = self.invoke_with_retry(handler.as_ref(), event, opts).await {
                self.metrics.write().failed += 1;
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        {
            let mut metrics = self.metrics.write();
            metrics.avg_latency_ms = 0.5 * metrics.avg_latency_ms + 0.5 * elapsed_ms;
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn invoke_with_retry(&self, handler: &dyn EventHandler, event: &EventRecord, opts: &PublishOptions) -> Result<()> {
        let Some(retry) = &opts.retry else {
            return handler.handle(event).await;
        };

        let mut attempt = 0;
        loop {
            match handler.handle(event).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    attempt += 1;
                    if attempt >= retry.max_attempts {
                        return Err(error);
                    }
                    tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn record(event_type: &str) -> EventRecord {
        let payload = serde_json::json!({});
        serde_json::from_value(serde_json::json!({
            "event_id": "evt-1",
            "event_type": event_type,
            "aggregate_id": "agg-1",
            "aggregate_type": "Test",
            "version": 1,
            "event_data": payload,
            "metadata": {},
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .unwrap()
    }

    struct Counting {
        order: Arc<RwLock<Vec<&'static str>>>,
        name: &'static str,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &EventRecord) -> Result<()> {
            self.order.write().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn fan_out_runs_typed_before_all_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));

        bus.subscribe(
            "X",
            Arc::new(Counting {
                order: order.clone(),
                name: "h1",
            }),
        )
        .unwrap();
        bus.subscribe(
            "X",
            Arc::new(Counting {
                order: order.clone(),
                name: "h2",
            }),
        )
        .unwrap();
        bus.subscribe_all(Arc::new(Counting {
            order: order.clone(),
            name: "hall",
        }))
        .unwrap();

        bus.publish(record("X"), None).await.unwrap();

        assert_eq!(*order.read(), vec!["h1", "h2", "hall"]);
        let metrics = bus.metrics();
        assert_eq!(metrics.published, 1);
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.failed, 0);
    }

    struct Failing(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &EventRecord) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::new(ErrorCode::EventBusError, "boom"))
        }
    }

    #[tokio::test]
    async fn sync_publish_surfaces_first_handler_error() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.subscribe("X", Arc::new(Failing(calls.clone()))).unwrap();

        let err = bus.publish(record("X"), None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EventBusError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().failed, 1);
    }

    #[tokio::test]
    async fn start_stop_reject_duplicate_transitions() {
        let bus = EventBus::new();
        bus.start().unwrap();
        assert!(bus.start().is_err());
        bus.stop().unwrap();
        assert!(bus.stop().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler_from_fan_out() {
        let bus = EventBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));
        let id = bus
            .subscribe(
                "X",
                Arc::new(Counting {
                    order: order.clone(),
                    name: "h1",
                }),
            )
            .unwrap();

        bus.unsubscribe(&id);
        bus.publish(record("X"), None).await.unwrap();
        assert!(order.read().is_empty());
    }
}
