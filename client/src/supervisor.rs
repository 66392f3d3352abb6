//! Reconnection policy and backend liveness tracking
//!
//! Pure decision logic for the two resilience concerns the client carries
//! once it is registered in a match: when to retry a dropped server
//! connection, and how to interpret backend liveness probe results. The
//! network layer drives these and performs the actual I/O.

use log::info;
use shared::protocol::DisconnectReason;
use std::time::Duration;

/// Liveness probe cadence while the backend looks healthy.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(15);
/// Probe cadence once a probe has failed, to resolve the outage quickly.
pub const LIVENESS_INTERVAL_SHORT: Duration = Duration::from_secs(1);
/// Cadence of the match membership probe while registered in a match.
pub const MEMBERSHIP_INTERVAL: Duration = Duration::from_secs(10);

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// What the client should do about a disconnect.
#[derive(Debug, PartialEq, Eq)]
pub enum DisconnectDirective {
    /// Try again. `delay` is `None` for the immediate first attempt.
    Reconnect { delay: Option<Duration> },
    /// The disconnect is final; stop retrying and leave the match.
    Accept,
}

/// Escalating reconnect delay schedule.
///
/// The first attempt is immediate. Each later attempt waits, starting at
/// one second and doubling on every third delayed attempt, capped at ten
/// seconds: 1, 1, 2, 2, 2, 4, 4, 4, 8, ... The schedule resets when a
/// connection is established.
#[derive(Debug)]
pub struct ReconnectionBackoff {
    attempts: u32,
    delay: Duration,
}

impl ReconnectionBackoff {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            delay: INITIAL_RECONNECT_DELAY,
        }
    }

    /// Returns how long to wait before the next attempt, advancing the
    /// schedule. `None` means attempt immediately.
    pub fn delay_for_next_attempt(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts == 1 {
            return None;
        }

        let delayed_attempt = self.attempts - 1;
        if delayed_attempt % 3 == 0 {
            self.delay = (self.delay * 2).min(MAX_RECONNECT_DELAY);
        }
        Some(self.delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = INITIAL_RECONNECT_DELAY;
    }
}

impl Default for ReconnectionBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Reaction the caller should take to a probe result.
#[derive(Debug, PartialEq, Eq)]
pub enum ProbeTransition {
    None,
    /// First failure: probe faster until the outage resolves.
    ShortenInterval,
    /// Third consecutive failure: the backend is considered down.
    BackendDown,
    /// First success after being down: the backend is reachable again.
    BackendUp,
}

/// Debounced view of backend liveness built from probe outcomes.
///
/// Single failures only tighten the probe cadence; the backend is declared
/// down after three consecutive failures and up again on the next success.
#[derive(Debug)]
pub struct ProbeState {
    consecutive_failures: u32,
    backend_up: bool,
}

impl ProbeState {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            backend_up: true,
        }
    }

    pub fn is_backend_up(&self) -> bool {
        self.backend_up
    }

    pub fn record_failure(&mut self) -> ProbeTransition {
        self.consecutive_failures += 1;
        match self.consecutive_failures {
            1 => ProbeTransition::ShortenInterval,
            3 if self.backend_up => {
                self.backend_up = false;
                ProbeTransition::BackendDown
            }
            _ => ProbeTransition::None,
        }
    }

    pub fn record_success(&mut self) -> ProbeTransition {
        self.consecutive_failures = 0;
        if self.backend_up {
            ProbeTransition::None
        } else {
            self.backend_up = true;
            ProbeTransition::BackendUp
        }
    }
}

impl Default for ProbeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides how the client reacts to disconnects from the match server.
#[derive(Debug, Default)]
pub struct ConnectionSupervisor {
    backoff: ReconnectionBackoff,
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self {
            backoff: ReconnectionBackoff::new(),
        }
    }

    /// Classifies a disconnect. `reason` is the server-supplied string when
    /// there was one; transport losses (timeouts) carry none and are always
    /// retried.
    pub fn handle_disconnect(&mut self, reason: Option<&str>) -> DisconnectDirective {
        if let Some(reason) = reason.and_then(DisconnectReason::parse) {
            if reason.is_final() {
                info!("Disconnect is final ({}); not reconnecting", reason);
                return DisconnectDirective::Accept;
            }
        }
        DisconnectDirective::Reconnect {
            delay: self.backoff.delay_for_next_attempt(),
        }
    }

    /// Resets the retry schedule after a successful (re)connection.
    pub fn handle_connected(&mut self) {
        self.backoff.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reconnect_attempt_is_immediate() {
        let mut backoff = ReconnectionBackoff::new();
        assert_eq!(backoff.delay_for_next_attempt(), None);
    }

    #[test]
    fn delays_double_every_third_attempt_up_to_the_cap() {
        let mut backoff = ReconnectionBackoff::new();
        assert_eq!(backoff.delay_for_next_attempt(), None);

        let expected_secs = [1, 1, 2, 2, 2, 4, 4, 4, 8, 8, 8, 10, 10, 10, 10];
        for (i, &secs) in expected_secs.iter().enumerate() {
            assert_eq!(
                backoff.delay_for_next_attempt(),
                Some(Duration::from_secs(secs)),
                "delayed attempt {}",
                i + 1
            );
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = ReconnectionBackoff::new();
        for _ in 0..8 {
            backoff.delay_for_next_attempt();
        }

        backoff.reset();
        assert_eq!(backoff.delay_for_next_attempt(), None);
        assert_eq!(
            backoff.delay_for_next_attempt(),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn first_probe_failure_only_shortens_the_interval() {
        let mut probe = ProbeState::new();
        assert_eq!(probe.record_failure(), ProbeTransition::ShortenInterval);
        assert!(probe.is_backend_up());
    }

    #[test]
    fn backend_declared_down_on_third_consecutive_failure() {
        let mut probe = ProbeState::new();
        assert_eq!(probe.record_failure(), ProbeTransition::ShortenInterval);
        assert_eq!(probe.record_failure(), ProbeTransition::None);
        assert_eq!(probe.record_failure(), ProbeTransition::BackendDown);
        assert!(!probe.is_backend_up());

        // Further failures change nothing.
        assert_eq!(probe.record_failure(), ProbeTransition::None);
    }

    #[test]
    fn success_between_failures_prevents_down_declaration() {
        let mut probe = ProbeState::new();
        probe.record_failure();
        probe.record_failure();
        assert_eq!(probe.record_success(), ProbeTransition::None);

        // The streak starts over.
        assert_eq!(probe.record_failure(), ProbeTransition::ShortenInterval);
        assert_eq!(probe.record_failure(), ProbeTransition::None);
        assert!(probe.is_backend_up());
    }

    #[test]
    fn recovery_is_reported_once() {
        let mut probe = ProbeState::new();
        for _ in 0..3 {
            probe.record_failure();
        }
        assert_eq!(probe.record_success(), ProbeTransition::BackendUp);
        assert_eq!(probe.record_success(), ProbeTransition::None);
        assert!(probe.is_backend_up());
    }

    #[test]
    fn final_disconnect_reasons_are_accepted() {
        for reason in [
            "WAITING_FOR_PLAYERS_TIMEOUT",
            "GAME_ENDED",
            "SERVER_SHUTDOWN",
        ] {
            let mut supervisor = ConnectionSupervisor::new();
            assert_eq!(
                supervisor.handle_disconnect(Some(reason)),
                DisconnectDirective::Accept,
                "reason {}",
                reason
            );
        }
    }

    #[test]
    fn transport_loss_triggers_reconnection_with_backoff() {
        let mut supervisor = ConnectionSupervisor::new();
        assert_eq!(
            supervisor.handle_disconnect(None),
            DisconnectDirective::Reconnect { delay: None }
        );
        assert_eq!(
            supervisor.handle_disconnect(None),
            DisconnectDirective::Reconnect {
                delay: Some(Duration::from_secs(1))
            }
        );
    }

    #[test]
    fn unrecognized_reasons_are_retried() {
        let mut supervisor = ConnectionSupervisor::new();
        assert_eq!(
            supervisor.handle_disconnect(Some("SOMETHING_NEW")),
            DisconnectDirective::Reconnect { delay: None }
        );
    }

    #[test]
    fn successful_reconnection_resets_the_backoff() {
        let mut supervisor = ConnectionSupervisor::new();
        for _ in 0..5 {
            supervisor.handle_disconnect(None);
        }
        supervisor.handle_connected();
        assert_eq!(
            supervisor.handle_disconnect(None),
            DisconnectDirective::Reconnect { delay: None }
        );
    }
}
