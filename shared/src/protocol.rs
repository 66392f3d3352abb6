//! Wire types shared by the game server and the game client
//!
//! The transport exchanges bincode-encoded [`Packet`] values over UDP. Every
//! connection attempt carries a [`ConnectionPayload`] which the server
//! validates before approving the session. Rejections and server-initiated
//! disconnects carry a [`DisconnectReason`] as a plain string so that clients
//! built against older packet revisions can still display it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A match always hosts exactly two players.
pub const MAX_PLAYERS_PER_MATCH: usize = 2;

/// Reasons the server attaches to a denied approval or a forced disconnect.
///
/// The wire format is the string form (see [`DisconnectReason::as_str`]), not
/// the enum discriminant, so the set can grow without breaking old clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    ServerAccessDenied,
    NotAcceptingConnections,
    WaitingForPlayersTimeout,
    GameEnded,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ServerAccessDenied => "SERVER_ACCESS_DENIED",
            DisconnectReason::NotAcceptingConnections => "NOT_ACCEPTING_CONNECTIONS",
            DisconnectReason::WaitingForPlayersTimeout => "WAITING_FOR_PLAYERS_TIMEOUT",
            DisconnectReason::GameEnded => "GAME_ENDED",
            DisconnectReason::ServerShutdown => "SERVER_SHUTDOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SERVER_ACCESS_DENIED" => Some(DisconnectReason::ServerAccessDenied),
            "NOT_ACCEPTING_CONNECTIONS" => Some(DisconnectReason::NotAcceptingConnections),
            "WAITING_FOR_PLAYERS_TIMEOUT" => Some(DisconnectReason::WaitingForPlayersTimeout),
            "GAME_ENDED" => Some(DisconnectReason::GameEnded),
            "SERVER_SHUTDOWN" => Some(DisconnectReason::ServerShutdown),
            _ => None,
        }
    }

    /// True for reasons after which a client should not try to reconnect:
    /// the match is over or never started, so the disconnect is final.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DisconnectReason::WaitingForPlayersTimeout
                | DisconnectReason::GameEnded
                | DisconnectReason::ServerShutdown
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials attached to every connection attempt.
///
/// `username` is the stable identity (survives reconnects), `player_name` is
/// the display name, and `server_password` is the capability token issued by
/// the backend when the server was allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub username: String,
    pub player_name: String,
    pub server_password: String,
}

impl ConnectionPayload {
    pub fn new(username: &str, player_name: &str, server_password: &str) -> Self {
        Self {
            username: username.to_string(),
            player_name: player_name.to_string(),
            server_password: server_password.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// All packets exchanged between client and server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    // Client -> server
    Connect { payload: ConnectionPayload },
    Ping,
    Disconnect,

    // Server -> client
    Approved { session_id: u64 },
    Pong,
    /// Signal to load the gameplay scene; this is the "match started" trigger
    /// that ends the client's matchmaking process.
    LoadGameplay,
    Disconnected { reason: String },
}
