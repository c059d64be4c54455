//! Hub: connection admission, shard routing, registry, broker bridge.
//!
//! A hub fronts a set of shards. Channel names are hash-partitioned with
//! FNV-1a, so all state for a channel lives in exactly one shard and the
//! shard loop is the per-channel linearization point. The process-wide
//! registry maps `app_id` to its running hub for the foreign-call surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use ripple_protocol::{constants, frames, BroadcastMessage};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthProvider, AuthResult};
use crate::broker::Broker;
use crate::client::{Client, Outbound, DEFAULT_PING_PERIOD};
use crate::metrics;
use crate::shard::{HubShard, ShardCommand};
use crate::webhook::WebhookNotifier;

/// Mailbox depth of the hub fan-in channels.
const HUB_MAILBOX: usize = 64;

static HUB_REGISTRY: Lazy<DashMap<String, Arc<Hub>>> = Lazy::new(DashMap::new);

/// Register a hub under its app id. An existing registration is replaced,
/// which happens on configuration reload.
pub fn register_hub(app_id: &str, hub: Arc<Hub>) {
    if HUB_REGISTRY.insert(app_id.to_owned(), hub).is_some() {
        warn!(app_id = %app_id, "hub registry overwritten (likely config reload)");
    }
}

/// Remove a hub from the registry, but only if it is still the registered
/// instance for that app id.
pub fn unregister_hub(app_id: &str, hub: &Arc<Hub>) {
    HUB_REGISTRY.remove_if(app_id, |_, registered| Arc::ptr_eq(registered, hub));
}

/// Look up the running hub for an app id. Lock-free.
#[must_use]
pub fn get_hub(app_id: &str) -> Option<Arc<Hub>> {
    HUB_REGISTRY.get(app_id).map(|entry| Arc::clone(&entry))
}

/// A subscribe/unsubscribe intent in flight to the hub.
#[derive(Debug)]
pub struct Subscription {
    pub client: Arc<Client>,
    pub channel: String,
    pub auth_payload: Option<String>,
}

/// A `client-*` event in flight to the hub.
#[derive(Debug)]
pub struct ClientEvent {
    pub sender: Arc<Client>,
    pub channel: String,
    pub event: String,
    pub data: String,
}

/// Hub sizing knobs.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub max_connections: i64,
    /// 0 selects `2 x CPU`; always clamped to `[4, 64]`.
    pub num_shards: usize,
    pub ping_period: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            num_shards: 0,
            ping_period: DEFAULT_PING_PERIOD,
        }
    }
}

struct Mailboxes {
    subscribe_rx: mpsc::Receiver<Subscription>,
    unsubscribe_rx: mpsc::Receiver<Subscription>,
    client_event_rx: mpsc::Receiver<ClientEvent>,
}

/// The fan-out engine for one application.
pub struct Hub {
    app_id: String,
    auth: Arc<dyn AuthProvider>,
    broker: Arc<dyn Broker>,
    shards: Vec<HubShard>,
    num_shards: usize,
    activity_timeout: u64,
    max_connections: i64,

    conns: AtomicI64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    drained: Notify,
    token: CancellationToken,

    subscribe_tx: mpsc::Sender<Subscription>,
    unsubscribe_tx: mpsc::Sender<Subscription>,
    client_event_tx: mpsc::Sender<ClientEvent>,
    mailboxes: Mutex<Option<Mailboxes>>,
}

/// Clamp a shard count into the supported range. The upper bound of 64 is
/// load-bearing for the client shard bitmap.
fn clamp_shards(requested: usize) -> usize {
    let shards = if requested == 0 {
        std::thread::available_parallelism().map_or(8, |n| n.get() * 2)
    } else {
        requested
    };
    shards.clamp(4, 64)
}

/// Seconds of server inactivity after which clients should ping, surfaced
/// in the handshake. A sub-second ping period falls back to the protocol
/// recommendation of 120.
fn activity_timeout_secs(ping_period: Duration) -> u64 {
    let secs = ping_period.as_secs();
    if secs < 1 {
        120
    } else {
        secs
    }
}

fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

impl Hub {
    /// Create a hub and spawn its shard loops. Must be called within a
    /// tokio runtime; pair with [`Hub::run`].
    #[must_use]
    pub fn new(
        app_id: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        broker: Arc<dyn Broker>,
        webhook: WebhookNotifier,
        config: HubConfig,
        token: CancellationToken,
    ) -> Arc<Self> {
        let app_id = app_id.into();
        let num_shards = clamp_shards(config.num_shards);

        let shards = (0..num_shards)
            .map(|id| HubShard::spawn(id, Some(webhook.clone()), token.clone()))
            .collect();

        let (subscribe_tx, subscribe_rx) = mpsc::channel(HUB_MAILBOX);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::channel(HUB_MAILBOX);
        let (client_event_tx, client_event_rx) = mpsc::channel(HUB_MAILBOX);

        Arc::new(Self {
            app_id,
            auth,
            broker,
            shards,
            num_shards,
            activity_timeout: activity_timeout_secs(config.ping_period),
            max_connections: config.max_connections,
            conns: AtomicI64::new(0),
            clients: RwLock::new(HashMap::new()),
            drained: Notify::new(),
            token,
            subscribe_tx,
            unsubscribe_tx,
            client_event_tx,
            mailboxes: Mutex::new(Some(Mailboxes {
                subscribe_rx,
                unsubscribe_rx,
                client_event_rx,
            })),
        })
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    #[must_use]
    pub fn connection_count(&self) -> i64 {
        self.conns.load(Ordering::SeqCst)
    }

    /// The hub's cancellation scope; client scopes are children of it.
    #[must_use]
    pub fn scope(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn shard_index(&self, channel: &str) -> usize {
        fnv1a32(channel.as_bytes()) as usize % self.num_shards
    }

    fn shard_for(&self, channel: &str) -> &HubShard {
        &self.shards[self.shard_index(channel)]
    }

    /// Admit a connection.
    ///
    /// Over capacity returns `false` and indexes nothing; the caller owes
    /// the peer a 4100 close. On success the handshake frame is queued.
    pub fn register(&self, client: &Arc<Client>) -> bool {
        if self.conns.load(Ordering::SeqCst) >= self.max_connections {
            warn!(id = %client.id(), "max connections reached, rejecting");
            return false;
        }

        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client.id().to_owned(), Arc::clone(client));
        self.conns.fetch_add(1, Ordering::SeqCst);
        metrics::record_connection();

        debug!(id = %client.id(), "registered client");
        client.send(Outbound::Raw(frames::connection_established(
            client.id(),
            self.activity_timeout,
        )));
        true
    }

    /// Remove a connection and route cleanup to every shard whose bit is
    /// set in the client's membership bitmap. Idempotent.
    pub async fn unregister(&self, client: &Arc<Client>) {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client.id())
            .is_some();
        if !removed {
            return;
        }

        self.conns.fetch_sub(1, Ordering::SeqCst);
        metrics::record_disconnection();

        for (id, shard) in self.shards.iter().enumerate() {
            if client.has_shard(id) {
                shard.send(ShardCommand::Cleanup(Arc::clone(client))).await;
            }
        }

        self.drained.notify_waiters();
    }

    /// Authorize a private/presence subscription.
    pub async fn authorize(&self, client: &Client, channel: &str) -> AuthResult {
        if channel.len() > constants::MAX_CHANNEL_LENGTH {
            return AuthResult::deny();
        }
        self.auth.authorize(client, channel).await
    }

    /// Verify a sign-in signature.
    #[must_use]
    pub fn authenticate_user(&self, client: &Client, auth_sig: &str, user_data: &str) -> AuthResult {
        self.auth.authenticate_user(client, auth_sig, user_data)
    }

    /// Forward a subscribe intent to the hub loop.
    pub async fn submit_subscribe(&self, subscription: Subscription) {
        let _ = self.subscribe_tx.send(subscription).await;
    }

    /// Forward an unsubscribe intent to the hub loop.
    pub async fn submit_unsubscribe(&self, subscription: Subscription) {
        let _ = self.unsubscribe_tx.send(subscription).await;
    }

    /// Forward a `client-*` event to the hub loop.
    pub async fn submit_client_event(&self, event: ClientEvent) {
        let _ = self.client_event_tx.send(event).await;
    }

    /// Publish an event into the cluster.
    ///
    /// Returns `false` when any limit is exceeded, the payload is not
    /// valid JSON, or the broker rejects the message.
    pub async fn publish(&self, channel: &str, event: &str, data: &str) -> bool {
        if channel.len() > constants::MAX_CHANNEL_LENGTH {
            error!(channel = %channel, length = channel.len(), "publish failed, channel name too long");
            return false;
        }
        if event.len() > constants::MAX_EVENT_LENGTH {
            error!(event = %event, length = event.len(), "publish failed, event name too long");
            return false;
        }
        if data.len() > constants::MAX_DATA_SIZE {
            error!(length = data.len(), limit = constants::MAX_DATA_SIZE, "publish failed, data payload too large");
            return false;
        }

        metrics::record_message();

        let msg = match BroadcastMessage::new(channel, event, data) {
            Ok(msg) => msg,
            Err(e) => {
                error!(channel = %channel, error = %e, "publish failed, payload is not valid JSON");
                return false;
            }
        };

        if let Err(e) = self.broker.publish(msg).await {
            error!(error = %e, "broker publish failed");
            return false;
        }
        true
    }

    /// Drive the hub: route broker messages and client intents to shards
    /// until the scope is cancelled, then drain.
    pub async fn run(self: Arc<Self>) {
        info!(app_id = %self.app_id, shards = self.num_shards, "hub started");

        let mut broker_rx = match self.broker.subscribe().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!(error = %e, "failed to subscribe to broker");
                None
            }
        };

        let Some(mut mailboxes) = self
            .mailboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            error!(app_id = %self.app_id, "hub run invoked twice");
            return;
        };

        loop {
            tokio::select! {
                () = self.token.cancelled() => {
                    self.shutdown().await;
                    return;
                }

                msg = recv_or_pending(&mut broker_rx) => {
                    match msg {
                        Some(msg) => self.shard_for(&msg.channel).send(ShardCommand::Broadcast(msg)).await,
                        None => {
                            warn!("broker stream closed");
                            broker_rx = None;
                        }
                    }
                }

                sub = mailboxes.subscribe_rx.recv() => {
                    if let Some(sub) = sub {
                        if sub.channel.len() <= constants::MAX_CHANNEL_LENGTH {
                            self.shard_for(&sub.channel)
                                .send(ShardCommand::Subscribe {
                                    client: sub.client,
                                    channel: sub.channel,
                                    auth_payload: sub.auth_payload,
                                })
                                .await;
                        }
                    }
                }

                sub = mailboxes.unsubscribe_rx.recv() => {
                    if let Some(sub) = sub {
                        if sub.channel.len() <= constants::MAX_CHANNEL_LENGTH {
                            self.shard_for(&sub.channel)
                                .send(ShardCommand::Unsubscribe { client: sub.client, channel: sub.channel })
                                .await;
                        }
                    }
                }

                event = mailboxes.client_event_rx.recv() => {
                    if let Some(event) = event {
                        self.shard_for(&event.channel)
                            .send(ShardCommand::ClientMessage {
                                sender: event.sender,
                                channel: event.channel,
                                event: event.event,
                                data: event.data,
                            })
                            .await;
                    }
                }
            }
        }
    }

    async fn shutdown(&self) {
        info!(app_id = %self.app_id, "hub shutting down, draining connections");
        self.broker.close().await;

        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            for client in clients.values() {
                client.token().cancel();
            }
        }

        loop {
            let drained = self.drained.notified();
            if self.conns.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }
        info!(app_id = %self.app_id, "hub shutdown complete");
    }
}

async fn recv_or_pending(
    rx: &mut Option<mpsc::Receiver<BroadcastMessage>>,
) -> Option<BroadcastMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
