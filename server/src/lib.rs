//! Match session server library
//!
//! Exposes the server's building blocks so integration tests can drive a
//! full instance in-process: the phase state machine, the player slot
//! registry, the allocation coordinator, and the network event loop.

pub mod allocation;
pub mod lifecycle;
pub mod network;
pub mod session;
