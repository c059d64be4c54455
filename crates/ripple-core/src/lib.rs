//! # ripple-core
//!
//! The realtime fan-out engine behind the ripple server.
//!
//! This crate provides the pieces that enforce the protocol invariants and
//! bound resource use:
//!
//! - **Client** - per-connection handle with a bounded outbound queue
//! - **SubscriptionManager** - per-shard channel/client indexes and presence
//! - **HubShard** - single-threaded actor serializing one manager
//! - **Hub** - shard routing, admission, registry, broker bridge
//! - **AuthProvider** - remote authorization with a circuit breaker, local
//!   HMAC sign-in verification
//! - **Broker** - cross-node transport (in-memory or Redis pub/sub)
//! - **WebhookNotifier** - signed channel lifecycle notifications
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐    ┌─────┐    ┌──────────┐    ┌─────────────────────┐
//! │ Client │───▶│ Hub │───▶│ HubShard │───▶│ SubscriptionManager │
//! └────────┘    └─────┘    └──────────┘    └─────────────────────┘
//!                  │ ▲
//!                  ▼ │
//!               ┌────────┐
//!               │ Broker │
//!               └────────┘
//! ```

pub mod auth;
pub mod breaker;
pub mod broker;
pub mod client;
pub mod hub;
pub mod metrics;
pub mod redis_broker;
pub mod shard;
pub mod subscription;
pub mod webhook;

pub use auth::{AuthProvider, AuthResult, DispatcherAuthProvider, RequestDispatcher};
pub use broker::{Broker, BrokerError, MemoryBroker};
pub use client::{Client, ClientConfig, Outbound};
pub use hub::{get_hub, register_hub, unregister_hub, Hub, HubConfig};
pub use redis_broker::RedisBroker;
pub use webhook::WebhookNotifier;
