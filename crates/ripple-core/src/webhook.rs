//! Webhook notifications for channel lifecycle events.
//!
//! `channel_occupied` and `channel_vacated` are delivered fire-and-forget:
//! each notification runs in its own task so a slow or failing endpoint
//! never affects a shard loop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, error, warn};

/// Delivery timeout per notification.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Placeholder key sent alongside the signature; a single application
/// secret is assumed, so the key carries no routing information.
const WEBHOOK_KEY: &str = "ripple";

#[derive(Debug, Serialize)]
struct WebhookPayload {
    time_ms: u64,
    events: Vec<WebhookEvent>,
}

#[derive(Debug, Serialize)]
struct WebhookEvent {
    name: String,
    channel: String,
}

/// Async notifier for channel lifecycle webhooks.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: Option<String>,
    secret: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Build a notifier. Without a URL every notification is a no-op.
    #[must_use]
    pub fn new(url: Option<String>, secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("failed to build webhook HTTP client");
        Self {
            url: url.filter(|u| !u.is_empty()),
            secret: secret.filter(|s| !s.is_empty()),
            client,
        }
    }

    /// Send `{time_ms, events: [{name, channel}]}` in a detached task.
    pub fn notify(&self, event_name: &str, channel: &str) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let secret = self.secret.clone();
        let client = self.client.clone();
        let event_name = event_name.to_owned();
        let channel = channel.to_owned();

        tokio::spawn(async move {
            let payload = WebhookPayload {
                time_ms: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
                events: vec![WebhookEvent {
                    name: event_name.clone(),
                    channel: channel.clone(),
                }],
            };

            let Ok(body) = serde_json::to_vec(&payload) else {
                return;
            };

            let mut request = client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json");

            if let Some(secret) = &secret {
                request = request
                    .header("X-Pusher-Key", WEBHOOK_KEY)
                    .header("X-Pusher-Signature", sign_body(secret, &body));
            }

            match request.body(body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(event = %event_name, channel = %channel, "webhook sent");
                }
                Ok(response) => {
                    warn!(status = %response.status(), "webhook non-success response");
                }
                Err(e) => {
                    error!(error = %e, "webhook request failed");
                }
            }
        });
    }
}

/// Hex HMAC-SHA256 of the payload body, Pusher-compatible.
#[must_use]
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
