//! Match phase state machine with exit/enter observer dispatch

use log::info;

/// Phases a match session moves through, from process start to exit.
///
/// The machine is linear: every transition moves forward, and once
/// `ShuttingDown` is entered the process is on its way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchPhase {
    /// Process is starting; allocation has not been confirmed yet.
    Initializing,
    /// Allocation confirmed, waiting for both players to join.
    WaitingForPlayers,
    /// Both players present; gameplay load is being broadcast.
    PreparingGame,
    /// Match is being played.
    InGame,
    /// Match concluded; results and cleanup in flight.
    GameOver,
    /// Final teardown before process exit.
    ShuttingDown,
}

impl std::fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MatchPhase::Initializing => "Initializing",
            MatchPhase::WaitingForPlayers => "WaitingForPlayers",
            MatchPhase::PreparingGame => "PreparingGame",
            MatchPhase::InGame => "InGame",
            MatchPhase::GameOver => "GameOver",
            MatchPhase::ShuttingDown => "ShuttingDown",
        };
        write!(f, "{}", name)
    }
}

/// Token returned from observer registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type PhaseObserver = Box<dyn FnMut(MatchPhase) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    phase: MatchPhase,
    observer: PhaseObserver,
}

/// Owns the current [`MatchPhase`] and the observers notified on each
/// transition.
///
/// Transitions run exit observers for the old phase, assign the new phase,
/// then run enter observers for it, each list in registration order.
/// Observers must not call back into the lifecycle; anything they trigger
/// reaches the event loop as a queued command instead, so a transition
/// requested from inside a notification runs strictly after the current one
/// finishes.
pub struct ServerLifecycle {
    phase: MatchPhase,
    on_enter: Vec<Subscription>,
    on_exit: Vec<Subscription>,
    next_id: u64,
}

impl ServerLifecycle {
    pub fn new() -> Self {
        Self {
            phase: MatchPhase::Initializing,
            on_enter: Vec::new(),
            on_exit: Vec::new(),
            next_id: 0,
        }
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Registers an observer invoked after `phase` is entered.
    pub fn on_enter<F>(&mut self, phase: MatchPhase, observer: F) -> SubscriptionId
    where
        F: FnMut(MatchPhase) + Send + Sync + 'static,
    {
        let id = self.alloc_id();
        self.on_enter.push(Subscription {
            id,
            phase,
            observer: Box::new(observer),
        });
        id
    }

    /// Registers an observer invoked before `phase` is left.
    pub fn on_exit<F>(&mut self, phase: MatchPhase, observer: F) -> SubscriptionId
    where
        F: FnMut(MatchPhase) + Send + Sync + 'static,
    {
        let id = self.alloc_id();
        self.on_exit.push(Subscription {
            id,
            phase,
            observer: Box::new(observer),
        });
        id
    }

    /// Removes a previously registered observer. Returns false if the id is
    /// unknown (already removed).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.on_enter.len() + self.on_exit.len();
        self.on_enter.retain(|s| s.id != id);
        self.on_exit.retain(|s| s.id != id);
        before != self.on_enter.len() + self.on_exit.len()
    }

    /// Transitions to `next`. A transition to the current phase is a no-op
    /// and notifies nobody.
    pub fn set_phase(&mut self, next: MatchPhase) {
        if next == self.phase {
            return;
        }

        let previous = self.phase;
        for sub in self.on_exit.iter_mut().filter(|s| s.phase == previous) {
            (sub.observer)(previous);
        }

        self.phase = next;
        info!("Match phase: {} -> {}", previous, next);

        for sub in self.on_enter.iter_mut().filter(|s| s.phase == next) {
            (sub.observer)(next);
        }
    }

    fn alloc_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Default for ServerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn starts_in_initializing() {
        let lifecycle = ServerLifecycle::new();
        assert_eq!(lifecycle.phase(), MatchPhase::Initializing);
    }

    #[test]
    fn exit_observers_run_before_enter_observers() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = ServerLifecycle::new();

        let o = Arc::clone(&order);
        lifecycle.on_exit(MatchPhase::Initializing, move |_| {
            o.lock().unwrap().push("exit");
        });
        let o = Arc::clone(&order);
        lifecycle.on_enter(MatchPhase::WaitingForPlayers, move |_| {
            o.lock().unwrap().push("enter");
        });

        lifecycle.set_phase(MatchPhase::WaitingForPlayers);
        assert_eq!(*order.lock().unwrap(), vec!["exit", "enter"]);
    }

    #[test]
    fn observers_fire_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = ServerLifecycle::new();

        for i in 0..3 {
            let o = Arc::clone(&order);
            lifecycle.on_enter(MatchPhase::InGame, move |_| {
                o.lock().unwrap().push(i);
            });
        }

        lifecycle.set_phase(MatchPhase::InGame);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn transition_to_same_phase_notifies_nobody() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut lifecycle = ServerLifecycle::new();

        let f = Arc::clone(&fired);
        lifecycle.on_enter(MatchPhase::Initializing, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = Arc::clone(&fired);
        lifecycle.on_exit(MatchPhase::Initializing, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        lifecycle.set_phase(MatchPhase::Initializing);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.phase(), MatchPhase::Initializing);
    }

    #[test]
    fn unsubscribed_observer_no_longer_fires() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut lifecycle = ServerLifecycle::new();

        let f = Arc::clone(&fired);
        let id = lifecycle.on_enter(MatchPhase::GameOver, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(lifecycle.unsubscribe(id));
        assert!(!lifecycle.unsubscribe(id));

        lifecycle.set_phase(MatchPhase::GameOver);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observers_only_fire_for_their_phase() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut lifecycle = ServerLifecycle::new();

        let f = Arc::clone(&fired);
        lifecycle.on_enter(MatchPhase::GameOver, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        lifecycle.set_phase(MatchPhase::WaitingForPlayers);
        lifecycle.set_phase(MatchPhase::PreparingGame);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        lifecycle.set_phase(MatchPhase::GameOver);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
