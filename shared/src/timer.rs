//! Cancellable one-shot scheduled actions
//!
//! Used for countdown-style behavior: "do this in 60 seconds unless told
//! otherwise". Cancelling after the action already fired is a no-op;
//! cancelling before the delay elapses prevents the action from firing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handle returned by [`schedule`]. Dropping the handle does not cancel the
/// action; call [`CancellationHandle::cancel`] explicitly.
#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Prevents the action from firing if it hasn't yet; no-op otherwise.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs `action` after `delay` unless the returned handle is cancelled first.
pub fn schedule<F>(delay: Duration, action: F) -> CancellationHandle
where
    F: FnOnce() + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let fired = Arc::new(AtomicBool::new(false));
    let handle = CancellationHandle {
        cancelled: Arc::clone(&cancelled),
        fired: Arc::clone(&fired),
    };

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if !cancelled.load(Ordering::SeqCst) {
            fired.store(true, Ordering::SeqCst);
            action();
        }
    });

    handle
}
