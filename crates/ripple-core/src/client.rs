//! Per-connection client handle.
//!
//! A `Client` is created at WebSocket upgrade and lives until its read pump
//! exits. Producers anywhere in the system enqueue outbound payloads through
//! [`Client::send`]; only the connection's write pump drains the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics;

/// Outbound queue depth per client. Overflow drops the message.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Default deadline for a single socket write.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// Default window in which the peer must show liveness.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(120);
/// Default ping interval; must fire comfortably within the pong window.
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(108);

/// A payload queued for delivery to one client.
///
/// Fan-out paths enqueue a `Shared` frame so the serialization cost is paid
/// once per broadcast rather than once per subscriber.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A frame serialized for this client alone.
    Raw(String),
    /// A pre-serialized frame shared across subscribers.
    Shared(Arc<String>),
    /// Close the connection with the given code.
    Close { code: u16, reason: &'static str },
}

/// Timing knobs applied to each connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub pong_wait: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_period: DEFAULT_PING_PERIOD,
            write_wait: DEFAULT_WRITE_WAIT,
            pong_wait: DEFAULT_PONG_WAIT,
        }
    }
}

/// One live WebSocket connection.
pub struct Client {
    id: String,
    tx: mpsc::Sender<Outbound>,
    headers: HeaderMap,
    token: CancellationToken,
    config: ClientConfig,
    shard_mask: AtomicU64,
}

impl Client {
    /// Create a client and the receiving half of its outbound queue.
    ///
    /// The returned receiver belongs to the connection's write pump. The
    /// client's scope is a child of `parent` and is cancelled independently
    /// when the read pump exits.
    pub fn new(
        id: impl Into<String>,
        headers: HeaderMap,
        config: ClientConfig,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let client = Arc::new(Self {
            id: id.into(),
            tx,
            headers,
            token: parent.child_token(),
            config,
            shard_mask: AtomicU64::new(0),
        });
        (client, rx)
    }

    /// Socket id, unique per process.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request headers captured at upgrade, forwarded to the authorizer.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The connection's cancellation scope.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn config(&self) -> ClientConfig {
        self.config
    }

    /// Enqueue a payload without blocking.
    ///
    /// A full queue drops the payload and counts it: a slow subscriber must
    /// never stall a shard's fan-out loop.
    pub fn send(&self, payload: Outbound) {
        match self.tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_client_dropped();
                debug!(id = %self.id, "outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Enqueue a close frame.
    pub fn send_close(&self, code: u16, reason: &'static str) {
        self.send(Outbound::Close { code, reason });
    }

    /// Mark that shard `id` holds state for this client.
    ///
    /// Bits are never cleared during the client's lifetime.
    pub fn add_shard(&self, id: usize) {
        if id >= 64 {
            return;
        }
        self.shard_mask.fetch_or(1 << id, Ordering::Relaxed);
    }

    /// Whether shard `id` may hold state for this client.
    #[must_use]
    pub fn has_shard(&self, id: usize) -> bool {
        if id >= 64 {
            return false;
        }
        self.shard_mask.load(Ordering::Relaxed) & (1 << id) != 0
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish()
    }
}

/// Mint a socket id: `<unix-seconds>.<subsec-nanos>`.
///
/// The fractional part keeps ids unique per process at any realistic
/// connection rate; ties are broken by the kernel clock's resolution.
#[must_use]
pub fn mint_socket_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{}", now.as_secs(), now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (Arc<Client>, mpsc::Receiver<Outbound>) {
        Client::new(
            mint_socket_id(),
            HeaderMap::new(),
            ClientConfig::default(),
            &CancellationToken::new(),
        )
    }

    #[test]
    fn test_shard_mask() {
        let (client, _rx) = test_client();

        assert!(!client.has_shard(0));

        client.add_shard(5);
        assert!(client.has_shard(5));
        assert!(!client.has_shard(0));

        client.add_shard(63);
        assert!(client.has_shard(63));

        // Out-of-range ids are ignored and lose no state.
        client.add_shard(64);
        assert!(!client.has_shard(64));
        assert!(client.has_shard(5) && client.has_shard(63));
    }

    #[tokio::test]
    async fn test_send_drops_on_full_queue() {
        let (client, mut rx) = test_client();

        for i in 0..OUTBOUND_QUEUE_SIZE + 10 {
            client.send(Outbound::Raw(format!("msg-{i}")));
        }

        // Exactly the queue capacity is retained.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, OUTBOUND_QUEUE_SIZE);
    }

    #[test]
    fn test_socket_id_format() {
        let id = mint_socket_id();
        let (secs, nanos) = id.split_once('.').expect("dot separator");
        assert!(secs.parse::<u64>().is_ok());
        assert!(nanos.parse::<u32>().is_ok());
    }

    #[test]
    fn test_child_scope_cancelled_with_parent() {
        let parent = CancellationToken::new();
        let (client, _rx) = Client::new("1.2", HeaderMap::new(), ClientConfig::default(), &parent);

        assert!(!client.token().is_cancelled());
        parent.cancel();
        assert!(client.token().is_cancelled());
    }
}
