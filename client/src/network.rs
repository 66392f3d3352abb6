//! Client network layer: server transport and the match session loop
//!
//! [`ClientTransport`] owns the UDP socket and turns raw packets into
//! transport events. [`Client`] drives a whole match session on top of it:
//! the initial approval handshake, ping keepalive, reconnection with
//! backoff, and the two backend heartbeats (liveness and match
//! membership).

use crate::matchmaking::MatchAssignment;
use crate::supervisor::{
    ConnectionSupervisor, DisconnectDirective, ProbeState, ProbeTransition, LIVENESS_INTERVAL,
    LIVENESS_INTERVAL_SHORT, MEMBERSHIP_INTERVAL,
};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::backend::{BackendGateway, MatchMembership, SignedInUser};
use shared::heartbeat::HeartbeatLoop;
use shared::protocol::{ConnectionPayload, Packet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};

/// Connection attempts before the initial approval is given up on.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Silence from the server after which the connection counts as lost.
const PONG_TIMEOUT: Duration = Duration::from_secs(5);
/// Silence after a reconnect attempt before it counts as another loss.
const RECONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("invalid server address: {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error("server did not approve the connection")]
    NotApproved,
    #[error("connection to the transport task was lost")]
    TransportClosed,
}

/// What the transport reader surfaces to the session loop.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Approved { session_id: u64 },
    GameplayLoad,
    Disconnected { reason: Option<String> },
}

/// UDP transport to the match server.
pub struct ClientTransport {
    socket: Arc<UdpSocket>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    last_pong: Arc<Mutex<Instant>>,
}

impl ClientTransport {
    /// Binds a socket, connects it to the server, and spawns the reader
    /// task.
    pub async fn connect(server_addr: &str) -> Result<Self, ClientError> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(server_addr.parse::<std::net::SocketAddr>()?).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let last_pong = Arc::new(Mutex::new(Instant::now()));

        let reader_socket = Arc::clone(&socket);
        let reader_tx = event_tx.clone();
        let reader_pong = Arc::clone(&last_pong);
        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match reader_socket.recv(&mut buffer).await {
                    Ok(len) => {
                        let packet = match deserialize::<Packet>(&buffer[0..len]) {
                            Ok(packet) => packet,
                            Err(_) => {
                                warn!("Failed to deserialize packet from server");
                                continue;
                            }
                        };

                        let event = match packet {
                            Packet::Approved { session_id } => {
                                *lock_instant(&reader_pong) = Instant::now();
                                Some(TransportEvent::Approved { session_id })
                            }
                            Packet::LoadGameplay => Some(TransportEvent::GameplayLoad),
                            Packet::Disconnected { reason } => Some(TransportEvent::Disconnected {
                                reason: Some(reason),
                            }),
                            Packet::Pong => {
                                *lock_instant(&reader_pong) = Instant::now();
                                None
                            }
                            other => {
                                debug!("Ignoring unexpected packet: {:?}", other);
                                None
                            }
                        };

                        if let Some(event) = event {
                            if reader_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        Ok(Self {
            socket,
            event_tx,
            event_rx,
            last_pong,
        })
    }

    pub async fn recv_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<(), ClientError> {
        let data = serialize(packet)?;
        self.socket.send(&data).await?;
        Ok(())
    }

    /// True when the server has not answered a ping for `tolerance`.
    pub fn pong_stale(&self, tolerance: Duration) -> bool {
        lock_instant(&self.last_pong).elapsed() > tolerance
    }

    /// Injects a transport-loss disconnect into the event stream so every
    /// disconnect, observed or synthesized, flows through one path.
    pub fn synthesize_loss(&self) {
        let _ = self
            .event_tx
            .send(TransportEvent::Disconnected { reason: None });
    }
}

fn lock_instant(instant: &Arc<Mutex<Instant>>) -> std::sync::MutexGuard<'_, Instant> {
    match instant.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Commands other tasks queue into the session loop.
#[derive(Debug)]
enum ClientCommand {
    /// The backend no longer lists this account as in a match.
    MembershipLost,
}

/// Drives the client's side of a match session.
pub struct Client {
    backend: Arc<dyn BackendGateway>,
    user: SignedInUser,
    supervisor: ConnectionSupervisor,
    liveness: Arc<HeartbeatLoop>,
    liveness_state: Arc<Mutex<ProbeState>>,
    membership: Arc<HeartbeatLoop>,
}

impl Client {
    pub fn new(backend: Arc<dyn BackendGateway>, user: SignedInUser) -> Self {
        Self {
            backend,
            user,
            supervisor: ConnectionSupervisor::new(),
            liveness: Arc::new(HeartbeatLoop::new(LIVENESS_INTERVAL)),
            liveness_state: Arc::new(Mutex::new(ProbeState::new())),
            membership: Arc::new(HeartbeatLoop::new(MEMBERSHIP_INTERVAL)),
        }
    }

    /// Starts the backend liveness monitor. Runs for the rest of the
    /// process, independent of any match: a failed probe tightens the
    /// cadence, three in a row declare the backend down, and the next
    /// success restores both.
    pub fn start_liveness_monitor(&self) {
        let backend = Arc::clone(&self.backend);
        let heartbeat = Arc::clone(&self.liveness);
        let state = Arc::clone(&self.liveness_state);

        self.liveness.start(move || {
            let backend = Arc::clone(&backend);
            let heartbeat = Arc::clone(&heartbeat);
            let state = Arc::clone(&state);

            async move {
                let nonce: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(16)
                    .map(char::from)
                    .collect();
                let healthy = matches!(
                    backend.connection_test(&nonce).await,
                    Ok(echo) if echo == nonce
                );

                let transition = {
                    let mut state = match state.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if healthy {
                        state.record_success()
                    } else {
                        state.record_failure()
                    }
                };

                match transition {
                    ProbeTransition::ShortenInterval => {
                        warn!("Backend probe failed; tightening probe interval");
                        heartbeat.set_interval(LIVENESS_INTERVAL_SHORT);
                    }
                    ProbeTransition::BackendDown => error!("Backend connection lost"),
                    ProbeTransition::BackendUp => info!("Backend connection restored"),
                    ProbeTransition::None => {}
                }
                if healthy {
                    heartbeat.set_interval(LIVENESS_INTERVAL);
                }
            }
        });
    }

    /// Plays one match session to its conclusion: connect, stay connected
    /// through reconnects, and return once the disconnect is final or the
    /// backend drops the membership.
    pub async fn run_match(&mut self, assignment: &MatchAssignment) -> Result<(), ClientError> {
        let server_addr = format!("{}:{}", assignment.ip, assignment.port);
        let payload = ConnectionPayload::new(
            &self.user.username,
            &self.user.player_name,
            &assignment.server_password,
        );

        let mut transport = ClientTransport::connect(&server_addr).await?;
        let session_id = self.await_approval(&mut transport, &payload).await?;
        info!("Joined match at {} as session {}", server_addr, session_id);
        self.supervisor.handle_connected();
        // The session loop's own pings cover liveness while in a match.
        self.liveness.stop();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut ping = interval(PING_INTERVAL);
        let mut connected = true;
        let mut reconnect_sent_at: Option<Instant> = None;

        let outcome = loop {
            tokio::select! {
                event = transport.recv_event() => {
                    let event = match event {
                        Some(event) => event,
                        None => break Err(ClientError::TransportClosed),
                    };

                    match event {
                        TransportEvent::Approved { session_id } => {
                            info!("Reconnected as session {}", session_id);
                            connected = true;
                            reconnect_sent_at = None;
                            self.supervisor.handle_connected();
                            self.membership.stop();
                        }
                        TransportEvent::GameplayLoad => {
                            info!("Server is starting the match; loading gameplay");
                        }
                        TransportEvent::Disconnected { reason } => {
                            connected = false;
                            reconnect_sent_at = None;
                            match reason.as_deref() {
                                Some(reason) => info!("Disconnected by server: {}", reason),
                                None => warn!("Connection to the server lost"),
                            }

                            match self.supervisor.handle_disconnect(reason.as_deref()) {
                                DisconnectDirective::Accept => break Ok(()),
                                DisconnectDirective::Reconnect { delay } => {
                                    // While the server is out of reach, the
                                    // backend is the authority on whether the
                                    // match still exists.
                                    self.start_membership_monitor(cmd_tx.clone());

                                    if let Some(delay) = delay {
                                        sleep(delay).await;
                                    }
                                    let connect = Packet::Connect {
                                        payload: payload.clone(),
                                    };
                                    if let Err(e) = transport.send_packet(&connect).await {
                                        break Err(e);
                                    }
                                    reconnect_sent_at = Some(Instant::now());
                                }
                            }
                        }
                    }
                }

                Some(command) = cmd_rx.recv() => {
                    match command {
                        ClientCommand::MembershipLost => {
                            info!("No longer registered in a match; leaving");
                            if connected {
                                let _ = transport.send_packet(&Packet::Disconnect).await;
                            }
                            break Ok(());
                        }
                    }
                }

                _ = ping.tick() => {
                    if connected {
                        if let Err(e) = transport.send_packet(&Packet::Ping).await {
                            break Err(e);
                        }
                        if transport.pong_stale(PONG_TIMEOUT) {
                            connected = false;
                            transport.synthesize_loss();
                        }
                    } else if let Some(sent_at) = reconnect_sent_at {
                        // No answer to the last attempt; feed another loss
                        // through the supervisor so the schedule advances.
                        if sent_at.elapsed() >= RECONNECT_REPLY_TIMEOUT {
                            reconnect_sent_at = None;
                            transport.synthesize_loss();
                        }
                    }
                }
            }
        };

        self.membership.stop();
        self.start_liveness_monitor();
        outcome
    }

    /// Initial handshake: send the connection request until the server
    /// approves it, bounded in attempts. Denials are retried too; the
    /// server may still be opening its doors.
    async fn await_approval(
        &self,
        transport: &mut ClientTransport,
        payload: &ConnectionPayload,
    ) -> Result<u64, ClientError> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            transport
                .send_packet(&Packet::Connect {
                    payload: payload.clone(),
                })
                .await?;

            match timeout(CONNECT_RETRY_DELAY, transport.recv_event()).await {
                Ok(Some(TransportEvent::Approved { session_id })) => return Ok(session_id),
                Ok(Some(TransportEvent::Disconnected { reason })) => {
                    warn!(
                        "Connection attempt {} denied: {}",
                        attempt,
                        reason.unwrap_or_else(|| "unknown".to_string())
                    );
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                Ok(Some(other)) => debug!("Ignoring {:?} before approval", other),
                Ok(None) => return Err(ClientError::TransportClosed),
                Err(_) => debug!("No approval yet (attempt {})", attempt),
            }
        }

        Err(ClientError::NotApproved)
    }

    /// Starts the match membership heartbeat. When the backend stops
    /// listing this account as in a match, the session loop is told to
    /// leave.
    fn start_membership_monitor(&self, cmd_tx: mpsc::UnboundedSender<ClientCommand>) {
        let backend = Arc::clone(&self.backend);
        let username = self.user.username.clone();
        let session_token = self.user.session_token.clone();
        let heartbeat = Arc::clone(&self.membership);

        self.membership.start(move || {
            let backend = Arc::clone(&backend);
            let username = username.clone();
            let session_token = session_token.clone();
            let heartbeat = Arc::clone(&heartbeat);
            let cmd_tx = cmd_tx.clone();

            async move {
                match backend.check_user_in_match(&username, &session_token).await {
                    Ok(MatchMembership::InMatch) => {}
                    Ok(MatchMembership::NotInMatch) => {
                        heartbeat.stop();
                        let _ = cmd_tx.send(ClientCommand::MembershipLost);
                    }
                    Err(e) => warn!("Match membership check failed: {}", e),
                }
            }
        });
    }
}
