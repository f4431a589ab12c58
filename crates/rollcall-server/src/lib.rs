//! # rollcall-server
//!
//! The real-time side of rollcall: an axum gateway that authenticates
//! WebSocket sessions, tracks their topic subscriptions, and pushes
//! enrollment envelopes built from the store's change feed.
//!
//! - [`server::RollcallServer`]: router, background tasks, listener
//! - [`websocket`]: session lifecycle, subscription registry, event broker
//! - [`auth::JwtAuthority`]: HS256 token verification
//! - [`routes`]: REST resync surface

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::JwtAuthority;
pub use config::ServerConfig;
pub use error::{ApiError, ServerError};
pub use server::{RollcallServer, ServerHandle};
