//! Async cleanup obligations executed before process exit
//!
//! Components register named async actions ("unmark this server as
//! allocated") that must be attempted before the process dies. The shutdown
//! sequence runs them all and gates the actual exit on their completion:
//! every completion re-attempts the quit, which is vetoed until the last
//! obligation signals done.
//!
//! An obligation that never calls back would hang shutdown forever, so each
//! one runs under a timeout; obligations that time out or panic are logged
//! and treated as complete. Obligations must be registered before shutdown
//! starts.

use log::{info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send + Sync>;

/// Tracks quit attempts against pending cleanup obligations. Each obligation
/// completion triggers one quit attempt; with N obligations the first N-1
/// attempts are vetoed and the Nth proceeds. With zero obligations the first
/// attempt proceeds immediately.
#[derive(Debug)]
pub struct QuitGate {
    to_complete: usize,
    completed: usize,
}

impl QuitGate {
    pub fn new(obligations: usize) -> Self {
        Self {
            to_complete: obligations,
            completed: 0,
        }
    }

    /// True when quitting may proceed.
    pub fn try_quit(&self) -> bool {
        self.completed >= self.to_complete
    }

    /// Records one completed obligation and re-attempts the quit.
    /// Returns false while the attempt is still vetoed.
    pub fn signal_complete(&mut self) -> bool {
        self.completed += 1;
        self.try_quit()
    }
}

/// Registry of named async cleanup actions.
#[derive(Default)]
pub struct CleanupRegistry {
    obligations: HashMap<String, CleanupFn>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an obligation under `id`. A second registration with the
    /// same id is ignored, which keeps the action single-shot even when the
    /// registering event is delivered twice.
    pub fn add<F, Fut>(&mut self, id: &str, obligation: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.obligations
            .entry(id.to_string())
            .or_insert_with(|| Box::new(move || Box::pin(obligation())));
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.obligations.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.obligations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.obligations.is_empty()
    }

    /// Runs every obligation concurrently, each bounded by `timeout`, and
    /// returns once the quit gate opens. Timed-out or panicked obligations
    /// are logged and counted as complete so shutdown always terminates.
    pub async fn run_all(self, timeout: Duration) {
        let mut gate = QuitGate::new(self.obligations.len());
        if gate.try_quit() {
            return;
        }

        let mut handles = Vec::with_capacity(self.obligations.len());
        for (id, obligation) in self.obligations {
            let handle = tokio::spawn(tokio::time::timeout(timeout, obligation()));
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => info!("Cleanup obligation '{}' completed", id),
                Ok(Err(_)) => warn!("Cleanup obligation '{}' timed out", id),
                Err(e) => warn!("Cleanup obligation '{}' panicked: {}", id, e),
            }
            if gate.signal_complete() {
                break;
            }
        }
    }
}
