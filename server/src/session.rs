//! Player slot registry and connection approval
//!
//! A match has exactly two player slots. A slot is created the first time a
//! player is approved and survives disconnects, so the same account can
//! rejoin a match in progress; identity is the username carried in the
//! connection payload. Approval is a pure decision over the registry, the
//! current match phase, and the allocation password, in a fixed order so
//! that the most specific denial reason wins.

use crate::lifecycle::MatchPhase;
use shared::protocol::{ConnectionPayload, DisconnectReason, MAX_PLAYERS_PER_MATCH};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Outcome of a connection request.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionVerdict {
    /// Request accepted. `newly_registered` carries the username when this
    /// approval created a slot rather than re-attaching to one.
    Approved { newly_registered: Option<String> },
    /// Request denied; the reason is relayed to the client before it is
    /// dropped.
    Denied(DisconnectReason),
}

/// One player slot. Registration is permanent for the lifetime of the
/// process; connection state tracks the current transport attachment.
#[derive(Debug)]
pub struct ClientSlot {
    pub username: String,
    pub player_name: String,
    pub session_id: u64,
    pub addr: SocketAddr,
    pub connected: bool,
    pub last_seen: Instant,
}

/// Registry of the match's player slots.
pub struct SessionRegistry {
    slots: Vec<ClientSlot>,
    accepting: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(MAX_PLAYERS_PER_MATCH),
            accepting: false,
        }
    }

    /// Controls whether any connection can be approved at all. Off until
    /// allocation is confirmed and again once shutdown begins.
    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn connected_count(&self) -> usize {
        self.slots.iter().filter(|s| s.connected).count()
    }

    pub fn registered_count(&self) -> usize {
        self.slots.len()
    }

    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.slots
            .iter()
            .filter(|s| s.connected)
            .map(|s| s.addr)
            .collect()
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&ClientSlot> {
        self.slots.iter().find(|s| s.connected && s.addr == addr)
    }

    /// Decides whether a connection request is allowed in, and on success
    /// attaches the slot to `addr` under `session_id`.
    pub fn approve_connection(
        &mut self,
        payload: &ConnectionPayload,
        session_id: u64,
        addr: SocketAddr,
        phase: MatchPhase,
        server_password: Option<&str>,
    ) -> ConnectionVerdict {
        if !self.accepting || self.connected_count() >= MAX_PLAYERS_PER_MATCH {
            return ConnectionVerdict::Denied(DisconnectReason::NotAcceptingConnections);
        }
        let server_password = match server_password {
            Some(p) => p,
            None => return ConnectionVerdict::Denied(DisconnectReason::NotAcceptingConnections),
        };

        if payload.username.is_empty() || payload.player_name.is_empty() {
            return ConnectionVerdict::Denied(DisconnectReason::ServerAccessDenied);
        }
        if payload.server_password != server_password {
            return ConnectionVerdict::Denied(DisconnectReason::ServerAccessDenied);
        }

        // With both slots taken, only the registered identities get back in.
        // Both the account and the display name must match a slot.
        if self.slots.len() >= MAX_PLAYERS_PER_MATCH {
            let known_user = self.slots.iter().any(|s| s.username == payload.username);
            let known_name = self
                .slots
                .iter()
                .any(|s| s.player_name == payload.player_name);
            if !known_user || !known_name {
                return ConnectionVerdict::Denied(DisconnectReason::ServerAccessDenied);
            }
        }

        match phase {
            MatchPhase::WaitingForPlayers => {
                if let Some(slot) = self
                    .slots
                    .iter_mut()
                    .find(|s| s.username == payload.username)
                {
                    slot.session_id = session_id;
                    slot.addr = addr;
                    slot.connected = true;
                    slot.last_seen = Instant::now();
                    ConnectionVerdict::Approved {
                        newly_registered: None,
                    }
                } else {
                    self.slots.push(ClientSlot {
                        username: payload.username.clone(),
                        player_name: payload.player_name.clone(),
                        session_id,
                        addr,
                        connected: true,
                        last_seen: Instant::now(),
                    });
                    ConnectionVerdict::Approved {
                        newly_registered: Some(payload.username.clone()),
                    }
                }
            }
            MatchPhase::PreparingGame | MatchPhase::InGame => {
                match self
                    .slots
                    .iter_mut()
                    .find(|s| s.username == payload.username)
                {
                    Some(slot) => {
                        slot.session_id = session_id;
                        slot.addr = addr;
                        slot.connected = true;
                        slot.last_seen = Instant::now();
                        ConnectionVerdict::Approved {
                            newly_registered: None,
                        }
                    }
                    // The match already started; nobody new gets a slot.
                    None => ConnectionVerdict::Denied(DisconnectReason::ServerAccessDenied),
                }
            }
            _ => ConnectionVerdict::Denied(DisconnectReason::NotAcceptingConnections),
        }
    }

    /// Detaches the slot bound to `addr`. Returns its username if a
    /// connected slot was found.
    pub fn mark_disconnected(&mut self, addr: SocketAddr) -> Option<String> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.connected && s.addr == addr)?;
        slot.connected = false;
        Some(slot.username.clone())
    }

    /// Refreshes the idle clock for the slot bound to `addr`.
    pub fn touch(&mut self, addr: SocketAddr) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.connected && s.addr == addr)
        {
            slot.last_seen = Instant::now();
        }
    }

    /// Detaches every slot that has been silent longer than `idle_timeout`
    /// and returns their addresses.
    pub fn check_timeouts(&mut self, idle_timeout: Duration) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| s.connected) {
            if now.duration_since(slot.last_seen) > idle_timeout {
                slot.connected = false;
                timed_out.push(slot.addr);
            }
        }
        timed_out
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
