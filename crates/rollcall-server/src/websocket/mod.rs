//! WebSocket layer: sessions, subscriptions and fan-out.
//!
//! - [`connection`]: per-session state and outbound queue
//! - [`registry`]: topic → sessions, with authorization
//! - [`broker`]: facts → envelopes, dedup, replay buffer
//! - [`heartbeat`]: eviction of silent sessions
//! - [`handler`]: frame dispatch
//! - [`session`]: connection lifecycle

pub mod broker;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod session;
