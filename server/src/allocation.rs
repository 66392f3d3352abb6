//! Allocation confirmation latch and the waiting-for-players countdown
//!
//! The hosting layer can deliver the "server allocated" event more than
//! once (redeliveries, racing event sources). All side effects of
//! allocation must happen exactly once, so confirmation goes through a
//! latch here. The password handed back by the backend when the allocation
//! is marked is write-once for the same reason.
//!
//! The coordinator also owns the countdown that aborts the match if both
//! players fail to show up in time.

use log::{debug, warn};
use shared::timer::{self, CancellationHandle};
use std::time::Duration;

pub const DEFAULT_WAITING_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AllocationCoordinator {
    allocated: bool,
    server_password: Option<String>,
    countdown: Option<CancellationHandle>,
    waiting_timeout: Duration,
}

impl AllocationCoordinator {
    pub fn new(waiting_timeout: Duration) -> Self {
        Self {
            allocated: false,
            server_password: None,
            countdown: None,
            waiting_timeout,
        }
    }

    /// Latches the allocation. Returns true only on the first call; callers
    /// perform allocation side effects only when this returns true.
    pub fn confirm_allocation(&mut self) -> bool {
        if self.allocated {
            debug!("Ignoring duplicate allocation event");
            return false;
        }
        self.allocated = true;
        true
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Stores the password issued for this allocation. A second write is
    /// rejected and logged.
    pub fn store_password(&mut self, password: String) -> bool {
        if self.server_password.is_some() {
            warn!("Allocation password already set; ignoring new value");
            return false;
        }
        self.server_password = Some(password);
        true
    }

    pub fn password(&self) -> Option<&str> {
        self.server_password.as_deref()
    }

    /// Arms the waiting-for-players countdown. `on_timeout` fires once the
    /// full timeout elapses without a cancel. Re-arming replaces a pending
    /// countdown.
    pub fn start_waiting_countdown<F>(&mut self, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(handle) = self.countdown.take() {
            handle.cancel();
        }
        self.countdown = Some(timer::schedule(self.waiting_timeout, on_timeout));
    }

    /// Disarms a pending countdown. Safe to call when none is armed.
    pub fn cancel_waiting_countdown(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.cancel();
        }
    }

    pub fn countdown_armed(&self) -> bool {
        self.countdown.is_some()
    }
}

impl Default for AllocationCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_WAITING_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn allocation_latches_on_first_confirmation() {
        let mut coordinator = AllocationCoordinator::default();
        assert!(!coordinator.is_allocated());
        assert!(coordinator.confirm_allocation());
        assert!(coordinator.is_allocated());

        // Redelivered events must not act again.
        assert!(!coordinator.confirm_allocation());
        assert!(!coordinator.confirm_allocation());
    }

    #[test]
    fn password_is_write_once() {
        let mut coordinator = AllocationCoordinator::default();
        assert!(coordinator.store_password("first".to_string()));
        assert!(!coordinator.store_password("second".to_string()));
        assert_eq!(coordinator.password(), Some("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_fires_after_timeout() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut coordinator = AllocationCoordinator::new(Duration::from_secs(60));

        let f = Arc::clone(&fired);
        coordinator.start_waiting_countdown(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_countdown_never_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut coordinator = AllocationCoordinator::new(Duration::from_secs(60));

        let f = Arc::clone(&fired);
        coordinator.start_waiting_countdown(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        coordinator.cancel_waiting_countdown();
        assert!(!coordinator.countdown_armed());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_pending_countdown() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut coordinator = AllocationCoordinator::new(Duration::from_secs(60));

        let f = Arc::clone(&fired);
        coordinator.start_waiting_countdown(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(30)).await;

        let f = Arc::clone(&fired);
        coordinator.start_waiting_countdown(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        // Old countdown would have fired here.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
