//! Redis pub/sub broker.
//!
//! Fans broadcasts across nodes through a single well-known Redis channel.
//! The subscriber task reconnects with exponential backoff; an outage only
//! loses cross-node publishes for its duration, local fan-out is unaffected.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use ripple_protocol::BroadcastMessage;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, BROKER_BUFFER};

/// Well-known pub/sub channel shared by every node of a cluster. Kept
/// verbatim for interoperability with existing deployments.
pub const CLUSTER_CHANNEL: &str = "frankenphp:cluster:broadcast";

/// Cap on the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn backoff_for(attempt: u32) -> Duration {
    let exp = Duration::from_secs(1 << attempt.min(5));
    exp.min(MAX_BACKOFF)
}

/// Broker backed by Redis `PUBLISH`/`SUBSCRIBE`.
pub struct RedisBroker {
    client: redis::Client,
    publish_conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    token: CancellationToken,
}

impl RedisBroker {
    /// Connect lazily to the given `host:port` (empty selects localhost).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn new(addr: &str) -> Result<Self, BrokerError> {
        let addr = if addr.is_empty() { "localhost:6379" } else { addr };
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            publish_conn: Mutex::new(None),
            token: CancellationToken::new(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, msg: BroadcastMessage) -> Result<(), BrokerError> {
        if self.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let data = msg
            .to_bytes()
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let mut conn = self.connection().await?;
        let sent: Result<(), _> = conn.publish(CLUSTER_CHANNEL, data).await;
        if let Err(e) = sent {
            // Drop the cached connection so the next publish redials.
            *self.publish_conn.lock().await = None;
            return Err(BrokerError::Transport(e.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BroadcastMessage>, BrokerError> {
        let (tx, rx) = mpsc::channel(BROKER_BUFFER);
        tokio::spawn(run_subscriber(self.client.clone(), tx, self.token.clone()));
        Ok(rx)
    }

    async fn close(&self) {
        self.token.cancel();
        *self.publish_conn.lock().await = None;
    }
}

/// Subscription loop: connect, subscribe, forward, and on any failure tear
/// down and retry with `min(2^attempt, 30)` seconds of backoff. The attempt
/// counter resets after each successful subscribe.
async fn run_subscriber(
    client: redis::Client,
    tx: mpsc::Sender<BroadcastMessage>,
    token: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        if token.is_cancelled() {
            return;
        }

        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                let backoff = backoff_for(attempt);
                error!(error = %e, backoff = ?backoff, "redis connection failed, retrying");
                attempt += 1;
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        if let Err(e) = pubsub.subscribe(CLUSTER_CHANNEL).await {
            let backoff = backoff_for(attempt);
            error!(error = %e, backoff = ?backoff, "redis subscribe failed, retrying");
            attempt += 1;
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(backoff) => continue,
            }
        }

        attempt = 0;
        info!(channel = CLUSTER_CHANNEL, "redis subscribed to broadcast channel");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                item = stream.next() => {
                    let Some(redis_msg) = item else {
                        break;
                    };
                    let payload: Vec<u8> = match redis_msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(error = %e, "redis payload read error");
                            continue;
                        }
                    };
                    match BroadcastMessage::from_bytes(&payload) {
                        Ok(msg) => {
                            tokio::select! {
                                () = token.cancelled() => return,
                                sent = tx.send(msg) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "redis deserialize error"),
                    }
                }
            }
        }

        drop(stream);
        warn!("redis connection lost, reconnecting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_forms() {
        assert!(RedisBroker::new("").is_ok());
        assert!(RedisBroker::new("127.0.0.1:6379").is_ok());
        assert!(RedisBroker::new("redis://example.com:6380").is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_for(0), Duration::from_secs(1));
        assert_eq!(backoff_for(1), Duration::from_secs(2));
        assert_eq!(backoff_for(4), Duration::from_secs(16));
        assert_eq!(backoff_for(5), Duration::from_secs(30));
        assert_eq!(backoff_for(40), Duration::from_secs(30));
    }

    #[tokio::test]
    #[ignore = "requires a running redis at localhost:6379"]
    async fn test_pubsub_roundtrip() {
        let broker = RedisBroker::new("").unwrap();
        let mut rx = broker.subscribe().await.unwrap();

        // Give the subscriber a moment to attach.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let msg = BroadcastMessage::new("test-channel", "test-event", r#"{"foo":"bar"}"#).unwrap();
        broker.publish(msg).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("stream ended");
        assert_eq!(received.channel, "test-channel");
        assert_eq!(received.event, "test-event");
        assert_eq!(received.data.get(), r#"{"foo":"bar"}"#);

        broker.close().await;
    }
}
