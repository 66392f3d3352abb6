//! Generic repeating-probe primitive
//!
//! A [`HeartbeatLoop`] runs an async probe, waits for the configured
//! interval, and repeats. It backs both liveness checks the client performs
//! (backend reachability and match membership) and is safe to share behind an
//! `Arc` so a probe can retarget its own loop's interval.
//!
//! Stopping is cooperative: a stop request takes effect only after the
//! in-flight probe completes, so a probe that has started is always allowed
//! to finish and release whatever it acquired. Iterations of one loop never
//! overlap; the next delay is scheduled only after the probe returns.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct HeartbeatLoop {
    interval_ms: Arc<AtomicU64>,
    stop_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl HeartbeatLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: Arc::new(AtomicU64::new(interval.as_millis() as u64)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns the probe loop. No-op if the loop is already running; in that
    /// case a pending stop request is cancelled instead, which matches the
    /// case of re-starting the loop before a previous stop took effect.
    pub fn start<F, Fut>(&self, mut probe: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop_requested.store(false, Ordering::SeqCst);
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let interval_ms = Arc::clone(&self.interval_ms);
        let stop_requested = Arc::clone(&self.stop_requested);
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            loop {
                probe().await;
                if !stop_requested.load(Ordering::SeqCst) {
                    let delay = Duration::from_millis(interval_ms.load(Ordering::SeqCst));
                    tokio::time::sleep(delay).await;
                    if !stop_requested.load(Ordering::SeqCst) {
                        continue;
                    }
                }
                running.store(false, Ordering::SeqCst);
                // start() clears the stop flag before checking `running`. One
                // arriving between the stop observation above and this store
                // loses that check and spawns nothing, so take its restart
                // over here.
                if !stop_requested.load(Ordering::SeqCst)
                    && !running.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                break;
            }
        });
    }

    /// Requests a cooperative stop. The in-flight probe, if any, completes
    /// normally; no further iterations are scheduled afterwards.
    pub fn stop(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Retargets the delay between iterations. Applies from the next
    /// scheduled delay onward; an in-progress sleep is not interrupted.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
