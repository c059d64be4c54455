//! Foreign-call surface.
//!
//! These functions are the bridge exposed to embedded publishers: they
//! resolve the hub for an application and inject events into the cluster.
//! Both return plain booleans so the bridge layer stays trivial.

use ripple_core::get_hub;

/// Publish one event. Returns `false` when the app is unknown, a limit is
/// exceeded, or the broker rejects the message.
pub async fn publish(app_id: &str, channel: &str, event: &str, data: &str) -> bool {
    let Some(hub) = get_hub(app_id) else {
        return false;
    };
    hub.publish(channel, event, data).await
}

/// Publish one event to several channels. `channels_json` is a JSON array
/// of channel names. Succeeds only if every publish succeeds.
pub async fn broadcast_multi(app_id: &str, channels_json: &str, event: &str, data: &str) -> bool {
    let Some(hub) = get_hub(app_id) else {
        return false;
    };
    let Ok(channels) = serde_json::from_str::<Vec<String>>(channels_json) else {
        return false;
    };

    let mut success = true;
    for channel in &channels {
        if !hub.publish(channel, event, data).await {
            success = false;
        }
    }
    success
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::auth::{AuthProvider, AuthResult};
    use ripple_core::broker::MemoryBroker;
    use ripple_core::client::Client;
    use ripple_core::hub::{register_hub, unregister_hub, Hub, HubConfig};
    use ripple_core::WebhookNotifier;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct DenyAll;

    #[async_trait::async_trait]
    impl AuthProvider for DenyAll {
        async fn authorize(&self, _client: &Client, _channel: &str) -> AuthResult {
            AuthResult::deny()
        }
        fn authenticate_user(&self, _client: &Client, _sig: &str, _data: &str) -> AuthResult {
            AuthResult::deny()
        }
    }

    fn spawn_hub(app_id: &str) -> (Arc<Hub>, CancellationToken) {
        let token = CancellationToken::new();
        let hub = Hub::new(
            app_id,
            Arc::new(DenyAll),
            Arc::new(MemoryBroker::new()),
            WebhookNotifier::new(None, None),
            HubConfig::default(),
            token.clone(),
        );
        register_hub(app_id, Arc::clone(&hub));
        (hub, token)
    }

    #[tokio::test]
    async fn test_publish_requires_known_app() {
        assert!(!publish("api-no-such-app", "channel", "event", "{}").await);
    }

    #[tokio::test]
    async fn test_publish_through_registry() {
        let (hub, token) = spawn_hub("api-pub-app");

        assert!(publish("api-pub-app", "orders", "created", r#"{"id":1}"#).await);
        assert!(!publish("api-pub-app", &"c".repeat(300), "created", "{}").await);

        unregister_hub("api-pub-app", &hub);
        token.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_multi() {
        let (hub, token) = spawn_hub("api-multi-app");

        assert!(broadcast_multi("api-multi-app", r#"["a","b","c"]"#, "ev", "{}").await);
        // One failing channel fails the whole call.
        let channels = format!(r#"["a","{}"]"#, "c".repeat(300));
        assert!(!broadcast_multi("api-multi-app", &channels, "ev", "{}").await);
        // Malformed channel list.
        assert!(!broadcast_multi("api-multi-app", "not json", "ev", "{}").await);

        unregister_hub("api-multi-app", &hub);
        token.cancel();
    }
}
