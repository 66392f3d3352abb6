//! Matchmaking ticket lifecycle and server password exchange
//!
//! Finding a match is a three-step conversation: open a ticket with the
//! matchmaker, poll it until a server assignment comes back, then trade the
//! assignment (plus the session token) for the server password the
//! connection payload must carry. Failed or timed-out tickets are not
//! surfaced; the search starts over with a fresh ticket and only an
//! explicit cancel ends it without an assignment.
//!
//! Tickets are a remote resource. Whatever ends the search, a cancel, a
//! terminal ticket, or a consumed assignment, the open ticket is deleted
//! exactly once; the ticket id is moved out of the coordinator before the
//! delete call so a second path can never see it.

use async_trait::async_trait;
use log::{info, warn};
use shared::backend::BackendGateway;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// How often an in-progress ticket is polled, and how long a failed cycle
/// waits before opening a fresh ticket.
const TICKET_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Password fetch retries before abandoning an assignment.
const PASSWORD_FETCH_ATTEMPTS: u32 = 24;
const PASSWORD_FETCH_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum MatchmakingError {
    #[error("matchmaker error: {0}")]
    Matchmaker(String),
    #[error("matchmaking cancelled")]
    Cancelled,
}

/// State of a matchmaking ticket as reported by the matchmaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketStatus {
    InProgress,
    Assigned {
        ip: String,
        port: u16,
        message: String,
    },
    Failed(String),
    Timeout(String),
}

/// The matchmaker's ticket API.
#[async_trait]
pub trait MatchmakerGateway: Send + Sync {
    async fn create_ticket(&self, player_ids: &[String]) -> Result<String, MatchmakingError>;
    async fn ticket_status(&self, ticket_id: &str) -> Result<TicketStatus, MatchmakingError>;
    async fn delete_ticket(&self, ticket_id: &str) -> Result<(), MatchmakingError>;
}

/// Development matchmaker that assigns every ticket to a fixed local
/// server on the first poll, bypassing the live matchmaking service.
pub struct LocalMatchmaker {
    ip: String,
    port: u16,
}

impl LocalMatchmaker {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
        }
    }
}

#[async_trait]
impl MatchmakerGateway for LocalMatchmaker {
    async fn create_ticket(&self, _player_ids: &[String]) -> Result<String, MatchmakingError> {
        Ok("local".to_string())
    }

    async fn ticket_status(&self, _ticket_id: &str) -> Result<TicketStatus, MatchmakingError> {
        Ok(TicketStatus::Assigned {
            ip: self.ip.clone(),
            port: self.port,
            message: "local assignment".to_string(),
        })
    }

    async fn delete_ticket(&self, _ticket_id: &str) -> Result<(), MatchmakingError> {
        Ok(())
    }
}

/// Cooperative cancellation flag shared with whatever UI or signal handler
/// can abort the search.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the client needs to join its assigned server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchAssignment {
    pub ip: String,
    pub port: u16,
    pub server_password: String,
}

/// Drives a matchmaking search end to end.
pub struct MatchmakingCoordinator {
    matchmaker: Arc<dyn MatchmakerGateway>,
    backend: Arc<dyn BackendGateway>,
    open_ticket: Option<String>,
}

impl MatchmakingCoordinator {
    pub fn new(matchmaker: Arc<dyn MatchmakerGateway>, backend: Arc<dyn BackendGateway>) -> Self {
        Self {
            matchmaker,
            backend,
            open_ticket: None,
        }
    }

    /// Searches until an assignment with a usable password is found or
    /// `cancel` is flipped. Ticket failures and transient matchmaker errors
    /// restart the search; an assignment whose password never materializes
    /// is abandoned the same way.
    pub async fn find_match(
        &mut self,
        session_token: &str,
        username: &str,
        cancel: &CancelHandle,
    ) -> Result<MatchAssignment, MatchmakingError> {
        loop {
            if cancel.is_cancelled() {
                self.close_open_ticket().await;
                return Err(MatchmakingError::Cancelled);
            }

            if self.open_ticket.is_none() {
                match self.matchmaker.create_ticket(&[username.to_string()]).await {
                    Ok(ticket_id) => {
                        info!("Opened matchmaking ticket {}", ticket_id);
                        self.open_ticket = Some(ticket_id);
                    }
                    Err(e) => {
                        warn!("Failed to open a matchmaking ticket: {}", e);
                        sleep(TICKET_POLL_INTERVAL).await;
                        continue;
                    }
                }
            }

            let ticket_id = match &self.open_ticket {
                Some(id) => id.clone(),
                None => continue,
            };

            match self.matchmaker.ticket_status(&ticket_id).await {
                Ok(TicketStatus::InProgress) => {
                    sleep(TICKET_POLL_INTERVAL).await;
                }

                Ok(TicketStatus::Assigned { ip, port, message }) => {
                    info!("Assigned to {}:{} ({})", ip, port, message);
                    // The assignment consumes the ticket.
                    self.close_open_ticket().await;

                    match self
                        .fetch_password(session_token, username, &ip, port, cancel)
                        .await?
                    {
                        Some(server_password) => {
                            return Ok(MatchAssignment {
                                ip,
                                port,
                                server_password,
                            });
                        }
                        // Assignment went stale; search again.
                        None => continue,
                    }
                }

                Ok(TicketStatus::Failed(detail)) => {
                    warn!("Matchmaking ticket failed: {}; retrying", detail);
                    self.close_open_ticket().await;
                    sleep(TICKET_POLL_INTERVAL).await;
                }

                Ok(TicketStatus::Timeout(detail)) => {
                    warn!("Matchmaking ticket timed out: {}; retrying", detail);
                    self.close_open_ticket().await;
                    sleep(TICKET_POLL_INTERVAL).await;
                }

                Err(e) => {
                    warn!("Ticket poll failed: {}", e);
                    sleep(TICKET_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Trades the assignment for the server password. The backend only
    /// learns the password once the allocated server has checked in, so
    /// this retries for a while. Returns `Ok(None)` when every attempt
    /// comes back empty-handed.
    async fn fetch_password(
        &self,
        session_token: &str,
        username: &str,
        ip: &str,
        port: u16,
        cancel: &CancelHandle,
    ) -> Result<Option<String>, MatchmakingError> {
        for attempt in 1..=PASSWORD_FETCH_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(MatchmakingError::Cancelled);
            }

            match self
                .backend
                .get_server_password(session_token, username, ip, port)
                .await
            {
                Ok(password) if !password.is_empty() => return Ok(Some(password)),
                Ok(_) => warn!("Server password not available yet (attempt {})", attempt),
                Err(e) => warn!("Password fetch attempt {} failed: {}", attempt, e),
            }

            if attempt < PASSWORD_FETCH_ATTEMPTS {
                sleep(PASSWORD_FETCH_DELAY).await;
            }
        }

        warn!("Gave up waiting for the server password at {}:{}", ip, port);
        Ok(None)
    }

    /// Deletes the open ticket if there is one. Moving the id out first
    /// makes the delete single-shot no matter how many paths call this.
    async fn close_open_ticket(&mut self) {
        if let Some(ticket_id) = self.open_ticket.take() {
            if let Err(e) = self.matchmaker.delete_ticket(&ticket_id).await {
                warn!("Failed to delete matchmaking ticket {}: {}", ticket_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::backend::{BackendError, MatchMembership, SignedInUser};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn assigned(ip: &str, port: u16) -> TicketStatus {
        TicketStatus::Assigned {
            ip: ip.to_string(),
            port,
            message: "match found".to_string(),
        }
    }

    /// Matchmaker driven by a script of status responses.
    struct ScriptedMatchmaker {
        statuses: Mutex<Vec<TicketStatus>>,
        tickets_created: AtomicU32,
        deletes: AtomicU32,
        cancel_on_poll: Option<CancelHandle>,
    }

    impl ScriptedMatchmaker {
        fn new(statuses: Vec<TicketStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                tickets_created: AtomicU32::new(0),
                deletes: AtomicU32::new(0),
                cancel_on_poll: None,
            }
        }

        fn cancelling_after_first_poll(mut self, cancel: CancelHandle) -> Self {
            self.cancel_on_poll = Some(cancel);
            self
        }

        fn delete_count(&self) -> u32 {
            self.deletes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MatchmakerGateway for ScriptedMatchmaker {
        async fn create_ticket(&self, _: &[String]) -> Result<String, MatchmakingError> {
            let n = self.tickets_created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("ticket-{}", n))
        }

        async fn ticket_status(&self, _: &str) -> Result<TicketStatus, MatchmakingError> {
            if let Some(cancel) = &self.cancel_on_poll {
                cancel.cancel();
            }
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.is_empty() {
                Ok(TicketStatus::InProgress)
            } else {
                Ok(statuses.remove(0))
            }
        }

        async fn delete_ticket(&self, _: &str) -> Result<(), MatchmakingError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Backend stub: only the password exchange is reachable from these
    /// tests.
    struct PasswordBackend {
        responses: Mutex<Vec<Result<String, BackendError>>>,
        calls: AtomicU32,
    }

    impl PasswordBackend {
        fn new(responses: Vec<Result<String, BackendError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl BackendGateway for PasswordBackend {
        async fn sign_in(&self, _: &str, _: &str) -> Result<SignedInUser, BackendError> {
            unreachable!()
        }
        async fn check_session(&self, _: &str) -> Result<SignedInUser, BackendError> {
            unreachable!()
        }
        async fn mark_server_allocated(
            &self,
            _: i64,
            _: &str,
            _: u16,
        ) -> Result<String, BackendError> {
            unreachable!()
        }
        async fn unmark_server_allocated(&self, _: i64) -> Result<(), BackendError> {
            unreachable!()
        }
        async fn mark_user_in_match(&self, _: &str, _: &str, _: u16) -> Result<(), BackendError> {
            unreachable!()
        }
        async fn unmark_users_in_match(&self, _: &str, _: u16) -> Result<(), BackendError> {
            unreachable!()
        }
        async fn get_server_password(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: u16,
        ) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok("PW123".to_string())
            } else {
                responses.remove(0)
            }
        }
        async fn check_user_in_match(
            &self,
            _: &str,
            _: &str,
        ) -> Result<MatchMembership, BackendError> {
            unreachable!()
        }
        async fn connection_test(&self, _: &str) -> Result<String, BackendError> {
            unreachable!()
        }
        async fn post_match_result(
            &self,
            _: &str,
            _: u32,
            _: u32,
            _: Option<&str>,
        ) -> Result<(), BackendError> {
            unreachable!()
        }
    }

    fn coordinator(
        matchmaker: Arc<ScriptedMatchmaker>,
        backend: Arc<PasswordBackend>,
    ) -> MatchmakingCoordinator {
        MatchmakingCoordinator::new(matchmaker, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_yields_endpoint_and_password() {
        let matchmaker = Arc::new(ScriptedMatchmaker::new(vec![
            TicketStatus::InProgress,
            assigned("10.0.0.5", 9000),
        ]));
        let backend = Arc::new(PasswordBackend::new(vec![]));
        let mut coordinator = coordinator(Arc::clone(&matchmaker), backend);

        let assignment = coordinator
            .find_match("token", "alice", &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(
            assignment,
            MatchAssignment {
                ip: "10.0.0.5".to_string(),
                port: 9000,
                server_password: "PW123".to_string(),
            }
        );
        // The consumed ticket is closed exactly once.
        assert_eq!(matchmaker.delete_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_an_open_ticket_deletes_it_exactly_once() {
        let cancel = CancelHandle::new();
        let matchmaker = Arc::new(
            ScriptedMatchmaker::new(vec![TicketStatus::InProgress])
                .cancelling_after_first_poll(cancel.clone()),
        );
        let backend = Arc::new(PasswordBackend::new(vec![]));
        let mut coordinator = coordinator(Arc::clone(&matchmaker), backend);

        let result = coordinator.find_match("token", "alice", &cancel).await;

        assert!(matches!(result, Err(MatchmakingError::Cancelled)));
        assert_eq!(matchmaker.delete_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_any_ticket_deletes_nothing() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        let matchmaker = Arc::new(ScriptedMatchmaker::new(vec![]));
        let backend = Arc::new(PasswordBackend::new(vec![]));
        let mut coordinator = coordinator(Arc::clone(&matchmaker), backend);

        let result = coordinator.find_match("token", "alice", &cancel).await;

        assert!(matches!(result, Err(MatchmakingError::Cancelled)));
        assert_eq!(matchmaker.delete_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ticket_is_closed_and_the_search_restarts() {
        let matchmaker = Arc::new(ScriptedMatchmaker::new(vec![
            TicketStatus::Failed("no servers".to_string()),
            assigned("10.0.0.5", 9000),
        ]));
        let backend = Arc::new(PasswordBackend::new(vec![]));
        let mut coordinator = coordinator(Arc::clone(&matchmaker), backend);

        let assignment = coordinator
            .find_match("token", "alice", &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(assignment.ip, "10.0.0.5");
        // One delete for the failed ticket, one for the consumed one.
        assert_eq!(matchmaker.tickets_created.load(Ordering::SeqCst), 2);
        assert_eq!(matchmaker.delete_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_ticket_is_retried_the_same_way() {
        let matchmaker = Arc::new(ScriptedMatchmaker::new(vec![
            TicketStatus::Timeout("queue too long".to_string()),
            assigned("10.0.0.5", 9000),
        ]));
        let backend = Arc::new(PasswordBackend::new(vec![]));
        let mut coordinator = coordinator(Arc::clone(&matchmaker), backend);

        let assignment = coordinator
            .find_match("token", "alice", &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(assignment.port, 9000);
        assert_eq!(matchmaker.tickets_created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn password_fetch_retries_until_it_succeeds() {
        let matchmaker = Arc::new(ScriptedMatchmaker::new(vec![assigned("10.0.0.5", 9000)]));
        let backend = Arc::new(PasswordBackend::new(vec![
            Ok(String::new()),
            Err(BackendError::Refused("not ready".to_string())),
            Ok("PW123".to_string()),
        ]));
        let mut coordinator = coordinator(matchmaker, Arc::clone(&backend));

        let assignment = coordinator
            .find_match("token", "alice", &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(assignment.server_password, "PW123");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn local_matchmaker_assigns_immediately() {
        let matchmaker = Arc::new(LocalMatchmaker::new("127.0.0.1", 9000));
        let backend = Arc::new(PasswordBackend::new(vec![]));
        let mut coordinator = MatchmakingCoordinator::new(matchmaker, backend);

        let assignment = coordinator
            .find_match("token", "alice", &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(assignment.ip, "127.0.0.1");
        assert_eq!(assignment.port, 9000);
    }
}
