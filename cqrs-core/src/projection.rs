//! Projections (C13): the abstraction a read-model builder implements, and
//! the manager that dispatches persisted events to running projections
//! while tracking their lifecycle and processing metrics.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::instrument;

use crate::error::{Error, ErrorCode, Result};
use crate::serialization::EventRecord;

/// The lifecycle state of one registered projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionState {
    /// Not receiving events.
    #[default]
    Stopped,
    /// Receiving events normally.
    Running,
    /// Replaying historical events to catch up before resuming normal flow.
    CatchingUp,
    /// A handler error took this projection out of rotation.
    Faulted,
    /// A full rebuild from history is in progress.
    Rebuilding,
}

/// One recorded projection failure.
#[derive(Debug, Clone)]
pub struct ProjectionError {
    /// The projection's name.
    pub name: String,
    /// The event id that triggered the failure.
    pub event_id: String,
    /// The event type that triggered the failure.
    pub event_type: String,
    /// The failure itself.
    pub error: Error,
    /// When the failure occurred.
    pub timestamp: DateTime<Utc>,
    /// How many times this event had already been retried, if the caller
    /// tracks retries above the manager.
    pub retry_count: u32,
}

/// A read-model builder driven by persisted events.
#[async_trait]
pub trait Projection: Send + Sync {
    /// A stable, unique name used to key this projection's state/metrics.
    fn name(&self) -> &str;

    /// Whether this projection processes events of `event_type`.
    fn can_handle(&self, event_type: &str) -> bool;

    /// Applies `event` to this projection's read model(s).
    async fn project(&self, event: &EventRecord) -> Result<()>;
}

/// Rolling counters for the manager as a whole.
#[derive(Debug, Clone, Default)]
pub struct ProjectionMetrics {
    /// Number of registered projections.
    pub total: usize,
    /// Number currently [`ProjectionState::Running`].
    pub running: usize,
    /// Number currently [`ProjectionState::Faulted`].
    pub faulted: usize,
    /// Total events successfully dispatched to at least one projection.
    pub processed_events: u64,
    /// Exponentially-weighted moving average processing time, in milliseconds.
    pub avg_processing_time_ms: f64,
    /// Timestamp of the most recently processed event.
    pub last_processed_event: Option<DateTime<Utc>>,
    /// Recorded failures, most recent last.
    pub errors: Vec<ProjectionError>,
}

/// Registers projections, routes persisted events to the running ones, and
/// tracks their lifecycle and metrics.
#[derive(Default)]
pub struct ProjectionManager {
    projections: DashMap<String, Arc<dyn Projection>>,
    states: DashMap<String, ProjectionState>,
    metrics: RwLock<ProjectionMetrics>,
}

impl ProjectionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a projection, initially [`ProjectionState::Stopped`].
    pub fn register(&self, projection: Arc<dyn Projection>) {
        let name = projection.name().to_string();
        self.projections.insert(name.clone(), projection);
        self.states.insert(name, ProjectionState::Stopped);
        self.metrics.write().total = self.projections.len();
    }

    /// Returns the current state of `name`, if registered.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<ProjectionState> {
        self.states.get(name).map(|s| *s)
    }

    /// Returns a snapshot of the manager's metrics.
    #[must_use]
    pub fn metrics(&self) -> ProjectionMetrics {
        self.metrics.read().clone()
    }

    /// Moves every registered projection to [`ProjectionState::Running`].
    pub fn start(&self) {
        for mut state in self.states.iter_mut() {
            *state.value_mut() = ProjectionState::Running;
        }
        self.refresh_counts();
    }

    /// Moves every [`ProjectionState::Running`] projection to
    /// [`ProjectionState::Stopped`].
    pub fn stop(&self) {
        for mut state in self.states.iter_mut() {
            if *state.value() == ProjectionState::Running {
                *state.value_mut() = ProjectionState::Stopped;
            }
        }
        self.refresh_counts();
    }

    /// Resets `name` back to [`ProjectionState::Stopped`], clearing a fault.
    pub fn reset(&self, name: &str) {
        if let Some(mut state) = self.states.get_mut(name) {
            *state = ProjectionState::Stopped;
        }
        self.refresh_counts();
    }

    /// Rebuilds `name` from `history`: moves it to
    /// [`ProjectionState::Rebuilding`], replays every event in order, and on
    /// success moves it to [`ProjectionState::Running`]. On the first
    /// failure the projection is left [`ProjectionState::Faulted`] and the
    /// error is returned.
    ///
    /// # Errors
    /// Returns [`ErrorCode::NotFoundError`] if `name` is not registered, or
    /// the first projection error encountered during replay.
    pub async fn rebuild(&self, name: &str, history: &[EventRecord]) -> Result<()> {
        let projection = self
            .projections
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| Error::new(ErrorCode::NotFoundError, format!("no projection registered as '{name}'")))?;

        self.states.insert(name.to_string(), ProjectionState::Rebuilding);
        self.refresh_counts();

        for event in history {
            if let Err(error) = projection.project(event).await {
                self.states.insert(name.to_string(), ProjectionState::Faulted);
                self.record_error(name, event, error.clone());
                self.refresh_counts();
                return Err(error);
            }
        }

        self.states.insert(name.to_string(), ProjectionState::Running);
        self.refresh_counts();
        Ok(())
    }

    fn record_error(&self, name: &str, event: &EventRecord, error: Error) {
        let mut metrics = self.metrics.write();
        metrics.errors.push(ProjectionError {
            name: name.to_string(),
            event_id: event.event_id().to_string(),
            event_type: event.event_type().to_string(),
            error,
            timestamp: Utc::now(),
            retry_count: 0,
        });
    }

    fn refresh_counts(&self) {
        let mut metrics = self.metrics.write();
        metrics.total = self.projections.len();
        metrics.running = self.states.iter().filter(|s| *s.value() == ProjectionState::Running).count();
        metrics.faulted = self.states.iter().filter(|s| *s.value() == ProjectionState::Faulted).count();
    }

    /// Dispatches `event` to every registered, running projection that can
    /// handle its type, sequentially. The first handler error stops
    /// dispatch (remaining projections are not invoked for this event),
    /// faults that projection, and is returned to the caller.
    #[instrument(skip(self, event), fields(event_type = %event.event_type()))]
    pub async fn process_event(&self, event: &EventRecord) -> Result<()> {
        let started = Instant::now();

        let candidates: Vec<Arc<dyn Projection>> = self
            .projections
            .iter()
            .filter(|entry| {
                self.states.get(entry.key()).map(|s| *s == ProjectionState::Running).unwrap_or(false)
                    && entry.value().can_handle(event.event_type())
            })
            .map(|entry| entry.value().clone())
            .collect();

        for projection in candidates {
            if let Err(error) = projection.project(event).await {
                self.states.insert(projection.name().to_string(), ProjectionState::Faulted);
                self.record_error(projection.name(), event, error.clone());
                self.refresh_counts();
                return Err(error);
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = self.metrics.write();
        metrics.processed_events += 1;
        metrics.avg_processing_time_ms = 0.5 * metrics.avg_processing_time_ms + 0.5 * elapsed_ms;
        metrics.last_processed_event = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(event_type: &str) -> EventRecord {
        serde_json::from_value(serde_json::json!({
            "event_id": "evt-1",
            "event_type": event_type,
            "aggregate_id": "agg-1",
            "aggregate_type": "Test",
            "version": 1,
            "event_data": {},
            "metadata": {},
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .unwrap()
    }

    struct Counter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Projection for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn can_handle(&self, event_type: &str) -> bool {
            event_type == "Incremented"
        }
        async fn project(&self, _event: &EventRecord) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::new(ErrorCode::ValidationError, "boom"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn process_event_skips_stopped_and_non_matching_projections() {
        let manager = ProjectionManager::new();
        manager.register(Arc::new(Counter {
            calls: AtomicUsize::new(0),
            fail: false,
        }));

        manager.process_event(&record("Incremented")).await.unwrap();
        assert_eq!(manager.metrics().processed_events, 0);

        manager.start();
        manager.process_event(&record("Decremented")).await.unwrap();
        manager.process_event(&record("Incremented")).await.unwrap();
        assert_eq!(manager.metrics().processed_events, 1);
    }

    #[tokio::test]
    async fn failing_projection_faults_and_is_recorded() {
        let manager = ProjectionManager::new();
        manager.register(Arc::new(Counter {
            calls: AtomicUsize::new(0),
            fail: true,
        }));
        manager.start();

        let err = manager.process_event(&record("Incremented")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(manager.state("counter"), Some(ProjectionState::Faulted));
        assert_eq!(manager.metrics().faulted, 1);
        assert_eq!(manager.metrics().errors.len(), 1);
    }

    #[tokio::test]
    async fn rebuild_replays_history_then_runs() {
        let manager = ProjectionManager::new();
        manager.register(Arc::new(Counter {
            calls: AtomicUsize::new(0),
            fail: false,
        }));

        let history = vec![record("Incremented"), record("Incremented")];
        manager.rebuild("counter", &history).await.unwrap();
        assert_eq!(manager.state("counter"), Some(ProjectionState::Running));
    }
}
