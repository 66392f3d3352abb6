//! Shared components for the match session server and client
//!
//! This crate contains everything both binaries need to agree on or reuse:
//!
//! - [`protocol`]: wire packets, the connection payload, and the disconnect
//!   reason vocabulary
//! - [`backend`]: the HTTP backend gateway trait and its reqwest
//!   implementation
//! - [`heartbeat`]: a restartable periodic probe loop with a retargetable
//!   interval
//! - [`timer`]: one-shot cancellable deadlines
//! - [`cleanup`]: pre-exit async cleanup obligations and the quit gate

pub mod backend;
pub mod cleanup;
pub mod heartbeat;
pub mod protocol;
pub mod timer;
