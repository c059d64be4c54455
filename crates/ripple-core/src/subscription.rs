//! Per-shard subscription state.
//!
//! All maps here are owned by exactly one shard and touched only from its
//! loop, so no locking is needed. The `channels` and `clients` indexes are
//! mirror images; every mutation updates both. Presence channels carry two
//! additional indexes: the member roster and the client-to-user mapping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ripple_protocol::frames::{self, PresenceAuthPayload, PresenceChannelData};
use ripple_protocol::{BroadcastMessage, ChannelKind};
use serde_json::json;
use serde_json::value::RawValue;
use tracing::warn;

use crate::client::{Client, Outbound};
use crate::metrics;
use crate::webhook::WebhookNotifier;

/// A presence channel roster entry.
#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: String,
    /// Opaque user info, `null` when the authorizer provided none.
    pub user_info: Box<RawValue>,
}

/// Channel/client indexes for one shard.
pub struct SubscriptionManager {
    /// channel -> socket id -> client.
    channels: HashMap<String, HashMap<String, Arc<Client>>>,
    /// socket id -> subscribed channels. Mirror of `channels`.
    clients: HashMap<String, HashSet<String>>,
    /// presence channel -> user id -> member.
    presence: HashMap<String, HashMap<String, Member>>,
    /// presence channel -> socket id -> user id.
    client_user: HashMap<String, HashMap<String, String>>,
    webhook: Option<WebhookNotifier>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(webhook: Option<WebhookNotifier>) -> Self {
        Self {
            channels: HashMap::new(),
            clients: HashMap::new(),
            presence: HashMap::new(),
            client_user: HashMap::new(),
            webhook,
        }
    }

    /// Add a subscription and acknowledge it to the client.
    pub fn subscribe(&mut self, client: &Arc<Client>, channel: &str, auth_payload: Option<&str>) {
        let is_new_channel = !self.channels.contains_key(channel);
        self.channels
            .entry(channel.to_owned())
            .or_default()
            .insert(client.id().to_owned(), Arc::clone(client));
        self.clients
            .entry(client.id().to_owned())
            .or_default()
            .insert(channel.to_owned());

        metrics::record_subscription();

        if is_new_channel {
            if let Some(webhook) = &self.webhook {
                webhook.notify("channel_occupied", channel);
            }
        }

        if ChannelKind::of(channel) == ChannelKind::Presence {
            self.presence_subscribe(client, channel, auth_payload);
        } else {
            client.send(Outbound::Raw(frames::subscription_succeeded(channel, "{}")));
        }
    }

    /// Drop a subscription. Silent when the client was not subscribed.
    pub fn unsubscribe(&mut self, client: &Arc<Client>, channel: &str) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(client.id());
            if subscribers.is_empty() {
                self.channels.remove(channel);
                if let Some(webhook) = &self.webhook {
                    webhook.notify("channel_vacated", channel);
                }
            }
        }
        if let Some(chans) = self.clients.get_mut(client.id()) {
            chans.remove(channel);
            if chans.is_empty() {
                self.clients.remove(client.id());
            }
        }
        if ChannelKind::of(channel) == ChannelKind::Presence {
            self.presence_unsubscribe(client, channel);
        }
    }

    /// Unsubscribe a disconnecting client from everything it holds here.
    pub fn remove_client(&mut self, client: &Arc<Client>) {
        let Some(chans) = self.clients.get(client.id()) else {
            return;
        };
        let chans: Vec<String> = chans.iter().cloned().collect();
        for channel in chans {
            self.unsubscribe(client, &channel);
        }
        self.clients.remove(client.id());
    }

    /// Fan a broadcast out to every subscriber of its channel.
    ///
    /// The wire frame is serialized once and enqueued by shared reference.
    pub fn broadcast_to_channel(&self, msg: &BroadcastMessage) {
        let Some(subscribers) = self.channels.get(&msg.channel) else {
            return;
        };
        let frame = Arc::new(frames::broadcast(&msg.channel, &msg.event, msg.data.get()));
        for client in subscribers.values() {
            client.send(Outbound::Shared(Arc::clone(&frame)));
        }
    }

    /// Fan a client event out to every subscriber except the sender.
    ///
    /// Only valid on private/presence channels the sender is a member of;
    /// anything else is a silent drop.
    pub fn broadcast_to_others(&self, sender: &Arc<Client>, channel: &str, event: &str, data: &str) {
        if !ChannelKind::of(channel).requires_auth() {
            return;
        }
        let is_member = self
            .clients
            .get(sender.id())
            .is_some_and(|chans| chans.contains(channel));
        if !is_member {
            return;
        }

        let Some(subscribers) = self.channels.get(channel) else {
            return;
        };
        let frame = Arc::new(frames::broadcast(channel, event, data));
        for (socket_id, client) in subscribers {
            if socket_id != sender.id() {
                client.send(Outbound::Shared(Arc::clone(&frame)));
            }
        }
    }

    fn presence_subscribe(&mut self, client: &Arc<Client>, channel: &str, auth_payload: Option<&str>) {
        let Ok(auth) = serde_json::from_str::<PresenceAuthPayload>(auth_payload.unwrap_or_default())
        else {
            warn!(id = %client.id(), "presence: invalid auth response");
            return;
        };
        if auth.channel_data.is_empty() {
            warn!(id = %client.id(), "presence: missing channel_data");
            return;
        }
        let Ok(channel_data) = serde_json::from_str::<PresenceChannelData>(&auth.channel_data) else {
            warn!(id = %client.id(), "presence: invalid channel_data JSON");
            return;
        };

        // user_id may be a JSON string or number; anything else is a reject.
        let user_id = match channel_data.user_id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                warn!(id = %client.id(), "presence: missing user_id");
                return;
            }
        };
        let user_info = channel_data
            .user_info
            .unwrap_or_else(|| RawValue::from_string("null".to_owned()).expect("null is valid JSON"));

        let roster = self.presence.entry(channel.to_owned()).or_default();
        let already_present = roster.contains_key(&user_id);
        roster.insert(
            user_id.clone(),
            Member {
                user_id: user_id.clone(),
                user_info: user_info.clone(),
            },
        );
        self.client_user
            .entry(channel.to_owned())
            .or_default()
            .insert(client.id().to_owned(), user_id.clone());

        client.send(Outbound::Raw(frames::subscription_succeeded(
            channel,
            &self.roster_payload(channel),
        )));

        if !already_present {
            let frame = Arc::new(frames::member_added(channel, &user_id, &user_info));
            if let Some(subscribers) = self.channels.get(channel) {
                for (socket_id, other) in subscribers {
                    if socket_id != client.id() {
                        other.send(Outbound::Shared(Arc::clone(&frame)));
                    }
                }
            }
        }
    }

    fn presence_unsubscribe(&mut self, client: &Arc<Client>, channel: &str) {
        let Some(user_map) = self.client_user.get_mut(channel) else {
            return;
        };
        let Some(user_id) = user_map.remove(client.id()) else {
            return;
        };
        let still_present = user_map.values().any(|uid| *uid == user_id);
        if user_map.is_empty() {
            self.client_user.remove(channel);
        }
        if still_present {
            return;
        }

        if let Some(roster) = self.presence.get_mut(channel) {
            roster.remove(&user_id);
            if roster.is_empty() {
                self.presence.remove(channel);
            }
        }

        let frame = Arc::new(frames::member_removed(channel, &user_id));
        if let Some(subscribers) = self.channels.get(channel) {
            for subscriber in subscribers.values() {
                subscriber.send(Outbound::Shared(Arc::clone(&frame)));
            }
        }
    }

    /// `{"presence":{"ids":[...],"hash":{id:info}}}`, stringified.
    fn roster_payload(&self, channel: &str) -> String {
        let mut ids = Vec::new();
        let mut hash = serde_json::Map::new();
        if let Some(roster) = self.presence.get(channel) {
            for (user_id, member) in roster {
                ids.push(user_id.clone());
                let info: serde_json::Value =
                    serde_json::from_str(member.user_info.get()).unwrap_or(serde_json::Value::Null);
                hash.insert(user_id.clone(), info);
            }
        }
        json!({ "presence": { "ids": ids, "hash": hash } }).to_string()
    }

    /// Number of subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, HashMap::len)
    }

    /// Whether the client currently holds the subscription.
    #[must_use]
    pub fn is_subscribed(&self, client: &Arc<Client>, channel: &str) -> bool {
        self.clients
            .get(client.id())
            .is_some_and(|chans| chans.contains(channel))
    }

    /// Roster user ids of a presence channel.
    #[must_use]
    pub fn presence_user_ids(&self, channel: &str) -> Vec<String> {
        self.presence
            .get(channel)
            .map(|roster| roster.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Check that `channels` and `clients` are exact mirrors. Test hook.
    #[must_use]
    pub fn indexes_are_mirrored(&self) -> bool {
        let forward = self.channels.iter().all(|(channel, subscribers)| {
            subscribers.keys().all(|socket_id| {
                self.clients
                    .get(socket_id)
                    .is_some_and(|chans| chans.contains(channel))
            })
        });
        let reverse = self.clients.iter().all(|(socket_id, chans)| {
            chans.iter().all(|channel| {
                self.channels
                    .get(channel)
                    .is_some_and(|subscribers| subscribers.contains_key(socket_id))
            })
        });
        forward && reverse
    }

    /// True when no state is held at all. Test hook.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
            && self.clients.is_empty()
            && self.presence.is_empty()
            && self.client_user.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use http::HeaderMap;
    use ripple_protocol::constants;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn test_client(id: &str) -> (Arc<Client>, mpsc::Receiver<Outbound>) {
        Client::new(id, HeaderMap::new(), ClientConfig::default(), &CancellationToken::new())
    }

    fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Option<serde_json::Value> {
        match rx.try_recv().ok()? {
            Outbound::Raw(text) => serde_json::from_str(&text).ok(),
            Outbound::Shared(text) => serde_json::from_str(&text).ok(),
            Outbound::Close { .. } => None,
        }
    }

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(None)
    }

    const PRESENCE_AUTH_ALICE: &str =
        r#"{"auth":"sig","channel_data":"{\"user_id\":\"123\",\"user_info\":{\"name\":\"Alice\"}}"}"#;

    #[test]
    fn test_subscribe_then_unsubscribe_restores_indexes() {
        let mut sm = manager();
        let (client, mut rx) = test_client("1.1");

        sm.subscribe(&client, "public-test", None);
        assert!(sm.indexes_are_mirrored());
        assert!(sm.is_subscribed(&client, "public-test"));
        assert_eq!(sm.subscriber_count("public-test"), 1);

        let frame = next_frame(&mut rx).unwrap();
        assert_eq!(frame["event"], constants::EVENT_SUBSCRIPTION_SUCCEEDED);
        assert_eq!(frame["channel"], "public-test");
        assert_eq!(frame["data"], "{}");

        sm.unsubscribe(&client, "public-test");
        assert!(sm.indexes_are_mirrored());
        assert!(sm.is_empty(), "indexes must be restored exactly");
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mut sm = manager();
        let (client, _rx) = test_client("1.2");

        sm.unsubscribe(&client, "never-subscribed");
        assert!(sm.is_empty());
    }

    #[test]
    fn test_presence_subscribe_builds_roster() {
        let mut sm = manager();
        let (client, mut rx) = test_client("socket-id-1");

        sm.subscribe(&client, "presence-test", Some(PRESENCE_AUTH_ALICE));
        assert_eq!(sm.presence_user_ids("presence-test"), vec!["123".to_string()]);

        let frame = next_frame(&mut rx).unwrap();
        assert_eq!(frame["event"], constants::EVENT_SUBSCRIPTION_SUCCEEDED);
        let data: serde_json::Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["presence"]["ids"][0], "123");
        assert_eq!(data["presence"]["hash"]["123"]["name"], "Alice");
    }

    #[test]
    fn test_presence_numeric_user_id() {
        let mut sm = manager();
        let (client, _rx) = test_client("1.3");

        let auth = r#"{"channel_data":"{\"user_id\":42}"}"#;
        sm.subscribe(&client, "presence-nums", Some(auth));
        assert_eq!(sm.presence_user_ids("presence-nums"), vec!["42".to_string()]);
    }

    #[test]
    fn test_presence_invalid_auth_keeps_plain_subscription() {
        let mut sm = manager();
        let (client, mut rx) = test_client("socket-id-2");

        sm.subscribe(&client, "presence-test", Some(r#"{"auth":"sig"}"#));

        // The channel subscription stands even though the roster rejected it.
        assert!(sm.is_subscribed(&client, "presence-test"));
        assert!(sm.presence_user_ids("presence-test").is_empty());
        // No succeeded frame is sent on a rejected presence payload.
        assert!(next_frame(&mut rx).is_none());
    }

    #[test]
    fn test_member_added_and_removed_fire_on_transitions() {
        let mut sm = manager();
        let (c1, mut rx1) = test_client("c1");
        let (c2, mut rx2) = test_client("c2");

        sm.subscribe(&c1, "presence-room", Some(r#"{"channel_data":"{\"user_id\":\"A\"}"}"#));
        let _ = next_frame(&mut rx1); // own succeeded

        sm.subscribe(&c2, "presence-room", Some(r#"{"channel_data":"{\"user_id\":\"B\"}"}"#));
        let _ = next_frame(&mut rx2); // own succeeded

        let added = next_frame(&mut rx1).expect("c1 sees B join");
        assert_eq!(added["event"], constants::EVENT_MEMBER_ADDED);
        let data: serde_json::Value = serde_json::from_str(added["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["user_id"], "B");

        sm.unsubscribe(&c2, "presence-room");
        let removed = next_frame(&mut rx1).expect("c1 sees B leave");
        assert_eq!(removed["event"], constants::EVENT_MEMBER_REMOVED);
        let data: serde_json::Value = serde_json::from_str(removed["data"].as_str().unwrap()).unwrap();
        assert_eq!(data["user_id"], "B");
    }

    #[test]
    fn test_member_events_only_on_first_join_last_leave() {
        let mut sm = manager();
        let (observer, mut observer_rx) = test_client("obs");
        let (first, mut first_rx) = test_client("tab-1");
        let (second, _second_rx) = test_client("tab-2");

        let same_user = r#"{"channel_data":"{\"user_id\":\"U\"}"}"#;
        sm.subscribe(&observer, "presence-room", Some(r#"{"channel_data":"{\"user_id\":\"O\"}"}"#));
        let _ = next_frame(&mut observer_rx);

        sm.subscribe(&first, "presence-room", Some(same_user));
        let _ = next_frame(&mut first_rx);
        assert_eq!(
            next_frame(&mut observer_rx).unwrap()["event"],
            constants::EVENT_MEMBER_ADDED
        );

        // A second connection of the same user is not a join.
        sm.subscribe(&second, "presence-room", Some(same_user));
        assert!(next_frame(&mut observer_rx).is_none());

        // First connection leaving is not a leave while the second remains.
        sm.unsubscribe(&first, "presence-room");
        assert!(next_frame(&mut observer_rx).is_none());
        assert_eq!(sm.presence_user_ids("presence-room").len(), 2);

        sm.unsubscribe(&second, "presence-room");
        assert_eq!(
            next_frame(&mut observer_rx).unwrap()["event"],
            constants::EVENT_MEMBER_REMOVED
        );
    }

    #[test]
    fn test_broadcast_to_channel() {
        let mut sm = manager();
        let (c1, mut rx1) = test_client("b1");
        let (c2, mut rx2) = test_client("b2");
        sm.subscribe(&c1, "orders", None);
        sm.subscribe(&c2, "orders", None);
        let _ = next_frame(&mut rx1);
        let _ = next_frame(&mut rx2);

        let msg = BroadcastMessage::new("orders", "created", r#"{"id":7}"#).unwrap();
        sm.broadcast_to_channel(&msg);

        for rx in [&mut rx1, &mut rx2] {
            let frame = next_frame(rx).unwrap();
            assert_eq!(frame["event"], "created");
            assert_eq!(frame["channel"], "orders");
            assert_eq!(frame["data"], r#"{"id":7}"#);
        }
    }

    #[test]
    fn test_broadcast_to_others_excludes_sender() {
        let mut sm = manager();
        let (sender, mut sender_rx) = test_client("s");
        let (other, mut other_rx) = test_client("o");
        sm.subscribe(&sender, "private-room", None);
        sm.subscribe(&other, "private-room", None);
        let _ = next_frame(&mut sender_rx);
        let _ = next_frame(&mut other_rx);

        sm.broadcast_to_others(&sender, "private-room", "client-typing", r#"{"on":true}"#);

        assert!(next_frame(&mut sender_rx).is_none());
        let frame = next_frame(&mut other_rx).unwrap();
        assert_eq!(frame["event"], "client-typing");
    }

    #[test]
    fn test_broadcast_to_others_requires_membership_and_kind() {
        let mut sm = manager();
        let (sender, _sender_rx) = test_client("s2");
        let (other, mut other_rx) = test_client("o2");

        // Public channels never carry client events.
        sm.subscribe(&sender, "public-room", None);
        sm.subscribe(&other, "public-room", None);
        while next_frame(&mut other_rx).is_some() {}
        sm.broadcast_to_others(&sender, "public-room", "client-x", "{}");
        assert!(next_frame(&mut other_rx).is_none());

        // Non-members are dropped silently.
        sm.subscribe(&other, "private-members", None);
        while next_frame(&mut other_rx).is_some() {}
        sm.broadcast_to_others(&sender, "private-members", "client-x", "{}");
        assert!(next_frame(&mut other_rx).is_none());
    }

    #[test]
    fn test_remove_client_clears_everything() {
        let mut sm = manager();
        let (client, _rx) = test_client("gone");
        let (stayer, mut stayer_rx) = test_client("stays");

        sm.subscribe(&client, "public-a", None);
        sm.subscribe(&client, "private-b", None);
        sm.subscribe(&client, "presence-c", Some(r#"{"channel_data":"{\"user_id\":\"G\"}"}"#));
        sm.subscribe(&stayer, "presence-c", Some(r#"{"channel_data":"{\"user_id\":\"S\"}"}"#));
        while next_frame(&mut stayer_rx).is_some() {}

        sm.remove_client(&client);

        assert!(!sm.is_subscribed(&client, "public-a"));
        assert!(!sm.is_subscribed(&client, "private-b"));
        assert_eq!(sm.presence_user_ids("presence-c"), vec!["S".to_string()]);
        assert!(sm.indexes_are_mirrored());

        let frame = next_frame(&mut stayer_rx).unwrap();
        assert_eq!(frame["event"], constants::EVENT_MEMBER_REMOVED);
    }

    #[test]
    fn test_churn_preserves_invariants() {
        let mut sm = manager();
        let clients: Vec<_> = (0..20).map(|i| test_client(&format!("c{i}"))).collect();

        for (i, (client, _)) in clients.iter().enumerate() {
            for j in 0..5 {
                sm.subscribe(client, &format!("room-{}", (i + j) % 7), None);
            }
        }
        assert!(sm.indexes_are_mirrored());

        for (i, (client, _)) in clients.iter().enumerate() {
            if i % 2 == 0 {
                sm.remove_client(client);
            } else {
                sm.unsubscribe(client, &format!("room-{}", i % 7));
            }
            assert!(sm.indexes_are_mirrored());
        }
    }
}
