//! Shard actor.
//!
//! Each shard owns one [`SubscriptionManager`] and mutates it only from its
//! own loop. All five operation kinds travel through a single bounded
//! mailbox, so the shard is the per-channel serialization point: subscribers
//! observe broadcasts in mailbox order.

use std::sync::Arc;

use ripple_protocol::BroadcastMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::subscription::SubscriptionManager;
use crate::webhook::WebhookNotifier;

/// Mailbox depth of a shard.
pub const SHARD_MAILBOX: usize = 64;

/// Operations a shard executes.
#[derive(Debug)]
pub enum ShardCommand {
    Subscribe {
        client: Arc<Client>,
        channel: String,
        auth_payload: Option<String>,
    },
    Unsubscribe {
        client: Arc<Client>,
        channel: String,
    },
    Broadcast(BroadcastMessage),
    ClientMessage {
        sender: Arc<Client>,
        channel: String,
        event: String,
        data: String,
    },
    Cleanup(Arc<Client>),
}

/// Handle to a running shard.
pub struct HubShard {
    id: usize,
    tx: mpsc::Sender<ShardCommand>,
}

impl HubShard {
    /// Spawn a shard loop. Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(id: usize, webhook: Option<WebhookNotifier>, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(SHARD_MAILBOX);
        tokio::spawn(run_shard(id, rx, SubscriptionManager::new(webhook), token));
        Self { id, tx }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Post a command to the shard mailbox.
    ///
    /// Errors are ignored: the mailbox only closes during shutdown, when
    /// pending cleanups are moot.
    pub async fn send(&self, command: ShardCommand) {
        let _ = self.tx.send(command).await;
    }
}

async fn run_shard(
    id: usize,
    mut rx: mpsc::Receiver<ShardCommand>,
    mut subs: SubscriptionManager,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => {
                debug!(shard = id, "shard stopped");
                return;
            }
            command = rx.recv() => {
                let Some(command) = command else { return };
                match command {
                    ShardCommand::Subscribe { client, channel, auth_payload } => {
                        client.add_shard(id);
                        subs.subscribe(&client, &channel, auth_payload.as_deref());
                    }
                    ShardCommand::Unsubscribe { client, channel } => {
                        subs.unsubscribe(&client, &channel);
                    }
                    ShardCommand::Broadcast(msg) => {
                        subs.broadcast_to_channel(&msg);
                    }
                    ShardCommand::ClientMessage { sender, channel, event, data } => {
                        subs.broadcast_to_others(&sender, &channel, &event, &data);
                    }
                    ShardCommand::Cleanup(client) => {
                        subs.remove_client(&client);
                    }
                }
            }
        }
    }
}
