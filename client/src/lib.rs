//! Match client library
//!
//! The pieces a match client is made of: matchmaking ticket handling,
//! reconnection and liveness policy, and the network session loop. The
//! binary in `main.rs` wires them to the live backend; integration tests
//! wire them to stand-ins.

pub mod matchmaking;
pub mod network;
pub mod supervisor;
