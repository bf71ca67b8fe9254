//! Command and query dispatchers (C7): thread-safe handler registries that
//! route an envelope to its registered handler and shape the result.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

pub mod command_dispatcher;
pub mod query_dispatcher;

pub use command_dispatcher::{CommandDispatcher, CommandHandler};
pub use query_dispatcher::{QueryDispatcher, QueryHandler};

/// A cooperative cancellation signal shared between a caller and an
/// in-flight dispatch. Dispatch races the handler future against
/// [`cancelled`][Self::cancelled] so a cancelled caller does not wait for a
/// stuck handler.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled and wakes any waiters.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns whether [`cancel`][Self::cancel] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        // Snapshot the `Notified` future before checking the flag: a
        // `notify_waiters` racing with this check is still observed because
        // the future records its creation point, not just its poll point.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
