//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

/// What the run loop does once it observes a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Stop at the next checkpoint boundary. The run stays resumable.
    #[default]
    Pause,
    /// Stop and record the run as failed.
    Abort,
}

#[derive(Debug, Clone)]
struct Cancellation {
    reason: String,
    mode: CancelMode,
}

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent: only the first reason and mode are kept.
/// The run loop checks the token between transitions; handlers may poll it
/// through their context to stop early.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    state: RwLock<Option<Cancellation>>,
    callbacks: RwLock<Vec<CancelCallback>>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a pause.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel_with(reason, CancelMode::Pause);
    }

    /// Requests an abort.
    pub fn abort(&self, reason: impl Into<String>) {
        self.cancel_with(reason, CancelMode::Abort);
    }

    /// Requests cancellation with an explicit mode.
    ///
    /// Callbacks run immediately; a panicking callback is logged and
    /// suppressed.
    pub fn cancel_with(&self, reason: impl Into<String>, mode: CancelMode) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.state.write() = Some(Cancellation {
                reason: reason.into(),
                mode,
            });

            let callbacks = self.callbacks.read();
            for callback in callbacks.iter() {
                invoke(callback.as_ref());
            }
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            invoke(&callback);
        } else {
            self.callbacks.write().push(Box::new(callback));
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.read().as_ref().map(|c| c.reason.clone())
    }

    /// Returns the cancellation mode, if any.
    #[must_use]
    pub fn mode(&self) -> Option<CancelMode> {
        self.state.read().as_ref().map(|c| c.mode)
    }
}

fn invoke(callback: &(dyn Fn() + Send + Sync)) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
        assert!(token.mode().is_none());
    }

    #[test]
    fn test_cancel_is_a_pause() {
        let token = CancellationToken::new();
        token.cancel("operator stop");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("operator stop".to_string()));
        assert_eq!(token.mode(), Some(CancelMode::Pause));
    }

    #[test]
    fn test_first_request_wins() {
        let token = CancellationToken::new();
        token.abort("first");
        token.cancel("second");

        assert_eq!(token.reason(), Some("first".to_string()));
        assert_eq!(token.mode(), Some(CancelMode::Abort));
    }

    #[test]
    fn test_on_cancel_before_and_after() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        token.cancel("test");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|| panic!("Intentional panic"));

        token.cancel("test");
        assert!(token.is_cancelled());
    }
}
