//! # ripple-server
//!
//! HTTP/WebSocket front end for the ripple realtime engine: configuration,
//! the upgrade endpoint with its handshake rate limiter, the per-connection
//! read/write pumps, and the foreign-call publish surface.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod limiter;

pub use config::Config;
pub use handlers::{build_router, AppState};
