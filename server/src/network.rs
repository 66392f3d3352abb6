//! Server network layer and match event loop
//!
//! All state lives on a single event loop. Network packets, lifecycle
//! observer reactions, and timer expiries all arrive as messages on
//! channels and are handled one at a time, so a phase transition requested
//! while another is being processed is queued rather than nested.

use crate::allocation::AllocationCoordinator;
use crate::lifecycle::{MatchPhase, ServerLifecycle};
use crate::session::{ConnectionVerdict, SessionRegistry};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::backend::BackendGateway;
use shared::cleanup::CleanupRegistry;
use shared::protocol::{DisconnectReason, Packet, MAX_PLAYERS_PER_MATCH};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

/// How long a client may stay silent before its slot is detached.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on each cleanup obligation during shutdown.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands processed by the main event loop. Lifecycle observers and
/// timers queue these instead of mutating server state directly.
#[derive(Debug)]
pub enum ServerCommand {
    CancelWaitingCountdown,
    WaitingTimeout,
    BroadcastGameplayLoad,
    /// Gameplay concluded; move the match into its end-of-game sequence.
    EndMatch,
    GameOverCleanup,
    BeginShutdown,
}

/// Messages sent from network tasks to the main event loop.
#[derive(Debug)]
enum ServerEvent {
    PacketReceived { packet: Packet, addr: SocketAddr },
}

/// Static facts about this server instance, supplied at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_id: i64,
    pub public_ip: String,
    pub port: u16,
    pub waiting_timeout: Duration,
}

/// Match session server: owns the socket, the phase machine, the player
/// registry, and the allocation state.
pub struct Server {
    socket: Arc<UdpSocket>,
    backend: Arc<dyn BackendGateway>,
    config: ServerConfig,

    lifecycle: ServerLifecycle,
    registry: SessionRegistry,
    allocation: AllocationCoordinator,
    cleanup: Option<CleanupRegistry>,
    next_session_id: u64,

    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
}

impl Server {
    pub async fn new(
        bind_addr: &str,
        config: ServerConfig,
        backend: Arc<dyn BackendGateway>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("Server listening on {}", bind_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let waiting_timeout = config.waiting_timeout;
        Ok(Server {
            socket,
            backend,
            config,
            lifecycle: ServerLifecycle::new(),
            registry: SessionRegistry::new(),
            allocation: AllocationCoordinator::new(waiting_timeout),
            cleanup: Some(CleanupRegistry::new()),
            next_session_id: 1,
            event_tx,
            event_rx,
            cmd_tx,
            cmd_rx,
        })
    }

    /// Port the socket actually bound to (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for queueing commands from outside the loop, e.g. ending the
    /// match when gameplay concludes.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<ServerCommand> {
        self.cmd_tx.clone()
    }

    /// Runs the server until shutdown completes.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.wire_lifecycle();
        self.spawn_network_receiver();

        // Allocation failure is fatal, but still exits through the shutdown
        // sequence so registered cleanup runs.
        let allocation_error = match self.handle_allocation().await {
            Ok(()) => None,
            Err(e) => {
                error!("Allocation failed: {}", e);
                self.lifecycle.set_phase(MatchPhase::ShuttingDown);
                Some(e)
            }
        };

        let mut timeout_interval = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    let ServerEvent::PacketReceived { packet, addr } = event;
                    self.handle_packet(packet, addr).await;
                }
                Some(command) = self.cmd_rx.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                _ = timeout_interval.tick() => {
                    self.sweep_timeouts();
                }
            }
        }

        info!("Server shut down");
        match allocation_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Registers lifecycle observers. Each one only queues a command; the
    /// actual work happens back on the event loop.
    fn wire_lifecycle(&mut self) {
        let tx = self.cmd_tx.clone();
        self.lifecycle
            .on_exit(MatchPhase::WaitingForPlayers, move |_| {
                let _ = tx.send(ServerCommand::CancelWaitingCountdown);
            });

        let tx = self.cmd_tx.clone();
        self.lifecycle
            .on_enter(MatchPhase::PreparingGame, move |_| {
                let _ = tx.send(ServerCommand::BroadcastGameplayLoad);
            });

        let tx = self.cmd_tx.clone();
        self.lifecycle.on_enter(MatchPhase::GameOver, move |_| {
            let _ = tx.send(ServerCommand::GameOverCleanup);
        });

        let tx = self.cmd_tx.clone();
        self.lifecycle
            .on_enter(MatchPhase::ShuttingDown, move |_| {
                let _ = tx.send(ServerCommand::BeginShutdown);
            });
    }

    /// Confirms the allocation with the backend, stores the issued
    /// password, and opens the doors for players.
    async fn handle_allocation(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.allocation.confirm_allocation() {
            return Ok(());
        }

        let password = self
            .backend
            .mark_server_allocated(
                self.config.server_id,
                &self.config.public_ip,
                self.config.port,
            )
            .await?;
        self.allocation.store_password(password);
        info!("Allocation confirmed for server {}", self.config.server_id);

        if let Some(cleanup) = self.cleanup.as_mut() {
            let backend = Arc::clone(&self.backend);
            let server_id = self.config.server_id;
            cleanup.add("unmark-server-allocated", move || async move {
                if let Err(e) = backend.unmark_server_allocated(server_id).await {
                    warn!("Failed to unmark server allocation: {}", e);
                }
            });
        }

        self.registry.set_accepting(true);
        self.lifecycle.set_phase(MatchPhase::WaitingForPlayers);

        let tx = self.cmd_tx.clone();
        self.allocation.start_waiting_countdown(move || {
            let _ = tx.send(ServerCommand::WaitingTimeout);
        });

        Ok(())
    }

    /// Spawns the task that feeds incoming datagrams to the event loop.
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if event_tx
                                .send(ServerEvent::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { payload } => {
                info!("Connection request from {} ({})", addr, payload.username);

                let session_id = self.next_session_id;
                let verdict = self.registry.approve_connection(
                    &payload,
                    session_id,
                    addr,
                    self.lifecycle.phase(),
                    self.allocation.password(),
                );

                match verdict {
                    ConnectionVerdict::Approved { newly_registered } => {
                        self.next_session_id += 1;
                        self.send_packet(&Packet::Approved { session_id }, addr)
                            .await;
                        info!(
                            "Approved {} as session {} ({} connected)",
                            payload.username,
                            session_id,
                            self.registry.connected_count()
                        );

                        if let Some(username) = newly_registered {
                            let backend = Arc::clone(&self.backend);
                            let ip = self.config.public_ip.clone();
                            let port = self.config.port;
                            tokio::spawn(async move {
                                if let Err(e) =
                                    backend.mark_user_in_match(&username, &ip, port).await
                                {
                                    warn!("Failed to mark {} as in match: {}", username, e);
                                }
                            });
                        }

                        if self.registry.connected_count() >= MAX_PLAYERS_PER_MATCH
                            && self.lifecycle.phase() == MatchPhase::WaitingForPlayers
                        {
                            self.lifecycle.set_phase(MatchPhase::PreparingGame);
                        }
                    }
                    ConnectionVerdict::Denied(reason) => {
                        info!("Denied {} from {}: {}", payload.username, addr, reason);
                        self.send_packet(
                            &Packet::Disconnected {
                                reason: reason.as_str().to_string(),
                            },
                            addr,
                        )
                        .await;
                    }
                }
            }

            Packet::Ping => {
                self.registry.touch(addr);
                self.send_packet(&Packet::Pong, addr).await;
            }

            Packet::Disconnect => {
                if let Some(username) = self.registry.mark_disconnected(addr) {
                    info!("{} disconnected ({})", username, addr);
                }
            }

            // Client-bound packets arriving here are protocol misuse.
            other => {
                debug!("Ignoring unexpected packet from {}: {:?}", addr, other);
            }
        }
    }

    /// Executes one queued command. Returns true when the loop should end.
    async fn handle_command(&mut self, command: ServerCommand) -> bool {
        match command {
            ServerCommand::CancelWaitingCountdown => {
                self.allocation.cancel_waiting_countdown();
            }

            ServerCommand::WaitingTimeout => {
                if self.lifecycle.phase() == MatchPhase::WaitingForPlayers {
                    warn!("Players did not fill the match in time; shutting down");
                    self.disconnect_all(DisconnectReason::WaitingForPlayersTimeout)
                        .await;
                    self.lifecycle.set_phase(MatchPhase::ShuttingDown);
                }
            }

            ServerCommand::BroadcastGameplayLoad => {
                self.broadcast(&Packet::LoadGameplay).await;
                self.lifecycle.set_phase(MatchPhase::InGame);
            }

            ServerCommand::EndMatch => {
                if self.lifecycle.phase() == MatchPhase::InGame {
                    self.lifecycle.set_phase(MatchPhase::GameOver);
                } else {
                    debug!("EndMatch ignored outside of InGame");
                }
            }

            ServerCommand::GameOverCleanup => {
                if self.registry.registered_count() > 0 {
                    if let Err(e) = self
                        .backend
                        .unmark_users_in_match(&self.config.public_ip, self.config.port)
                        .await
                    {
                        warn!("Failed to unmark users in match: {}", e);
                    }
                }
                self.disconnect_all(DisconnectReason::GameEnded).await;
                self.lifecycle.set_phase(MatchPhase::ShuttingDown);
            }

            ServerCommand::BeginShutdown => {
                self.registry.set_accepting(false);
                self.allocation.cancel_waiting_countdown();
                self.disconnect_all(DisconnectReason::ServerShutdown).await;

                if let Some(cleanup) = self.cleanup.take() {
                    info!("Running {} cleanup obligation(s)", cleanup.len());
                    cleanup.run_all(CLEANUP_TIMEOUT).await;
                }
                return true;
            }
        }
        false
    }

    fn sweep_timeouts(&mut self) {
        for addr in self.registry.check_timeouts(CLIENT_IDLE_TIMEOUT) {
            info!("Client {} timed out", addr);
        }
    }

    /// Sends a final disconnect notice to every connected client and
    /// detaches their slots.
    async fn disconnect_all(&mut self, reason: DisconnectReason) {
        let packet = Packet::Disconnected {
            reason: reason.as_str().to_string(),
        };
        for addr in self.registry.connected_addrs() {
            self.send_packet(&packet, addr).await;
            self.registry.mark_disconnected(addr);
        }
    }

    async fn broadcast(&self, packet: &Packet) {
        for addr in self.registry.connected_addrs() {
            self.send_packet(packet, addr).await;
        }
    }

    async fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        match serialize(packet) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
            Err(e) => error!("Failed to serialize packet: {}", e),
        }
    }
}
