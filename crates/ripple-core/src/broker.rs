//! Cluster broker abstraction and the in-memory implementation.
//!
//! A broker carries [`BroadcastMessage`]s between publishers and the hub.
//! Delivery is at most once: `publish` never blocks and may fail, and the
//! subscription stream simply ends when the broker closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ripple_protocol::BroadcastMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::metrics;

/// Buffer depth of broker subscription streams.
pub const BROKER_BUFFER: usize = 256;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker has been closed.
    #[error("broker closed")]
    Closed,
    /// The in-memory buffer is full; the message was dropped.
    #[error("broker buffer full")]
    Full,
    /// The single subscription stream was already handed out.
    #[error("broker already subscribed")]
    AlreadySubscribed,
    /// Transport-level failure (network broker).
    #[error("broker transport: {0}")]
    Transport(String),
}

/// Cross-node event transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message. Non-blocking; may fail.
    async fn publish(&self, msg: BroadcastMessage) -> Result<(), BrokerError>;

    /// Obtain the subscription stream. Called once, by the hub.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BroadcastMessage>, BrokerError>;

    /// Close the broker. Idempotent.
    async fn close(&self);
}

/// Single-node broker backed by a bounded in-process channel.
///
/// Used when no external message bus is configured.
pub struct MemoryBroker {
    tx: mpsc::Sender<BroadcastMessage>,
    rx: Mutex<Option<mpsc::Receiver<BroadcastMessage>>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(BROKER_BUFFER);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, msg: BroadcastMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                metrics::record_broker_dropped();
                warn!(channel = %msg.channel, event = %msg.event, "memory broker buffer full, dropping message");
                Err(BrokerError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BrokerError::Closed),
        }
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BroadcastMessage>, BrokerError> {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(BrokerError::AlreadySubscribed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
