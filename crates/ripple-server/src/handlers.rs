//! HTTP front end and the per-connection read/write pumps.
//!
//! The upgrade handler gates on protocol version and the handshake rate
//! limit, mints the socket id, and runs the two pumps that drive a
//! connection: the read pump parses inbound frames and dispatches them,
//! the write pump drains the client's outbound queue.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ripple_core::auth::{AuthProvider, DispatcherAuthProvider};
use ripple_core::broker::{Broker, MemoryBroker};
use ripple_core::client::{mint_socket_id, Client, ClientConfig, Outbound};
use ripple_core::hub::{register_hub, ClientEvent, Hub, HubConfig, Subscription};
use ripple_core::{RedisBroker, WebhookNotifier};
use ripple_protocol::frames::{ClientFrame, SignInData, SubscribeData};
use ripple_protocol::{constants, frames, is_valid_channel_name, ChannelKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::HttpDispatcher;
use crate::limiter::TokenBucket;

/// Shared server state.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Config,
    pub limiter: Option<TokenBucket>,
}

impl AppState {
    /// Wire up the production stack: HTTP dispatcher, broker by
    /// configuration, webhook notifier, and a running hub.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be constructed.
    pub fn new(
        config: Config,
        token: &CancellationToken,
    ) -> anyhow::Result<(Arc<Self>, JoinHandle<()>)> {
        info!(
            script = %config.auth_script,
            workers = config.num_workers,
            path = %config.auth_path,
            "auth dispatcher configured"
        );
        let dispatcher = Arc::new(HttpDispatcher::new(config.num_workers));
        let auth = Arc::new(DispatcherAuthProvider::new(
            dispatcher,
            &config.auth_path,
            config.webhook_secret.clone().unwrap_or_default(),
            config.max_auth_body,
            config.max_concurrent_auth,
        ));
        Self::with_auth(config, auth, token)
    }

    /// Wire up state around a caller-provided auth provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be constructed.
    pub fn with_auth(
        config: Config,
        auth: Arc<dyn AuthProvider>,
        token: &CancellationToken,
    ) -> anyhow::Result<(Arc<Self>, JoinHandle<()>)> {
        let webhook = WebhookNotifier::new(config.webhook_url.clone(), config.webhook_secret.clone());

        let broker: Arc<dyn Broker> = match config.redis_host.as_deref() {
            Some(host) if !host.is_empty() => {
                info!(host = %host, "using redis broker");
                Arc::new(RedisBroker::new(host)?)
            }
            _ => {
                info!("using memory broker");
                Arc::new(MemoryBroker::new())
            }
        };

        let hub = Hub::new(
            &config.app_id,
            auth,
            broker,
            webhook,
            HubConfig {
                max_connections: config.max_connections,
                num_shards: config.num_shards,
                ping_period: config.ping_period,
            },
            token.clone(),
        );
        register_hub(&config.app_id, Arc::clone(&hub));
        let hub_handle = tokio::spawn(Arc::clone(&hub).run());

        let limiter = TokenBucket::from_config(config.handshake_rate, config.handshake_burst);

        Ok((Arc::new(Self { hub, config, limiter }), hub_handle))
    }
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    // The protocol parameter is compared as a string, per the wire spec.
    if let Some(protocol) = params.get("protocol") {
        if protocol.as_str() < "5" {
            return (StatusCode::BAD_REQUEST, "Unsupported protocol version").into_response();
        }
    }

    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    };

    if let Some(limiter) = &state.limiter {
        if !limiter.allow() {
            warn!("handshake rate limit exceeded");
            return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
        }
    }

    ws.max_message_size(constants::MAX_DATA_SIZE + 1024)
        .on_upgrade(move |socket| handle_socket(socket, headers, state))
}

/// Run one connection to completion.
async fn handle_socket(socket: WebSocket, headers: HeaderMap, state: Arc<AppState>) {
    let socket_id = mint_socket_id();
    let client_config = ClientConfig {
        ping_period: state.config.ping_period,
        write_wait: state.config.write_wait,
        pong_wait: state.config.pong_wait,
    };
    let (client, outbound_rx) = Client::new(socket_id, headers, client_config, state.hub.scope());

    let (mut sender, receiver) = socket.split();

    if !state.hub.register(&client) {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: constants::CLOSE_OVER_CAPACITY,
                reason: "Over capacity".into(),
            })))
            .await;
        return;
    }

    let write = tokio::spawn(write_pump(sender, outbound_rx, client.token().clone(), client_config));

    read_pump(&state, &client, receiver).await;

    state.hub.unregister(&client).await;
    client.token().cancel();
    let _ = write.await;
    debug!(id = %client.id(), "connection closed");
}

/// Read loop: enforce the liveness deadline, reject binary frames, parse
/// and dispatch text frames.
async fn read_pump(state: &Arc<AppState>, client: &Arc<Client>, mut receiver: SplitStream<WebSocket>) {
    let pong_wait = client.config().pong_wait;

    loop {
        let next = tokio::select! {
            () = client.token().cancelled() => return,
            next = tokio::time::timeout(pong_wait, receiver.next()) => next,
        };

        let msg = match next {
            Err(_elapsed) => {
                debug!(id = %client.id(), "read deadline exceeded");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(id = %client.id(), error = %e, "websocket read error");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => handle_frame(state, client, &text).await,
            Message::Binary(_) => {
                warn!(id = %client.id(), "client sent binary frame, disconnecting");
                client.send_close(constants::CLOSE_BINARY_NOT_SUPPORTED, "Binary frames not supported");
                return;
            }
            // Any inbound frame proves liveness; the deadline resets on the
            // next loop iteration. Pings are answered by the transport.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return,
        }
    }
}

/// Parse one text frame and dispatch it.
async fn handle_frame(state: &Arc<AppState>, client: &Arc<Client>, text: &str) {
    let Ok(frame) = ClientFrame::parse(text) else {
        warn!(id = %client.id(), "invalid JSON frame");
        client.send(Outbound::Raw(frames::error_event(
            constants::CLOSE_GENERIC_RECONNECT,
            "Invalid JSON format",
        )));
        return;
    };

    if frame.event.len() > constants::MAX_EVENT_LENGTH {
        return;
    }

    if frame.event.starts_with(constants::PREFIX_CLIENT_EVENT) {
        let Some(channel) = frame.channel else {
            return;
        };
        if !is_valid_channel_name(&channel) {
            warn!(channel = %channel, "invalid channel name in client event");
            return;
        }
        let data = frame.data.map(|d| d.get().to_owned()).unwrap_or_default();
        if data.len() > constants::MAX_DATA_SIZE {
            return;
        }
        state
            .hub
            .submit_client_event(ClientEvent {
                sender: Arc::clone(client),
                channel,
                event: frame.event,
                data,
            })
            .await;
        return;
    }

    match frame.event.as_str() {
        constants::EVENT_PING => {
            client.send(Outbound::Raw(frames::pong()));
        }

        constants::EVENT_SUBSCRIBE => {
            let Some(data) = frame.data else { return };
            let Ok(sub) = serde_json::from_str::<SubscribeData>(data.get()) else {
                return;
            };
            if !is_valid_channel_name(&sub.channel) {
                return;
            }

            let mut auth_payload = None;
            if ChannelKind::of(&sub.channel).requires_auth() {
                let result = state.hub.authorize(client, &sub.channel).await;
                if !result.allowed {
                    client.send(Outbound::Raw(frames::error_event(
                        constants::CLOSE_SUBSCRIPTION_DENIED,
                        &format!("Subscription to {} rejected", sub.channel),
                    )));
                    return;
                }
                auth_payload = result.user_data;
            }

            state
                .hub
                .submit_subscribe(Subscription {
                    client: Arc::clone(client),
                    channel: sub.channel,
                    auth_payload,
                })
                .await;
        }

        constants::EVENT_UNSUBSCRIBE => {
            let Some(data) = frame.data else { return };
            let Ok(sub) = serde_json::from_str::<SubscribeData>(data.get()) else {
                return;
            };
            if !is_valid_channel_name(&sub.channel) {
                return;
            }
            state
                .hub
                .submit_unsubscribe(Subscription {
                    client: Arc::clone(client),
                    channel: sub.channel,
                    auth_payload: None,
                })
                .await;
        }

        constants::EVENT_SIGNIN => {
            let Some(data) = frame.data else { return };
            let Ok(signin) = serde_json::from_str::<SignInData>(data.get()) else {
                return;
            };
            let result = state.hub.authenticate_user(client, &signin.auth, &signin.user_data);
            if result.allowed {
                client.send(Outbound::Raw(frames::signin_success(
                    result.user_data.as_deref().unwrap_or_default(),
                )));
            } else {
                client.send(Outbound::Raw(frames::error_event(
                    constants::CLOSE_SUBSCRIPTION_DENIED,
                    "Signin authentication failed",
                )));
            }
        }

        // Unknown events are ignored.
        _ => {}
    }
}

/// Write loop: drain the outbound queue, tick pings, honor cancellation.
async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<Outbound>,
    token: CancellationToken,
    config: ClientConfig,
) {
    let mut ticker = tokio::time::interval(config.ping_period);
    ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            // Queued frames drain ahead of cancellation so a protocol close
            // (for example 4003) reaches the peer before the scope ends.
            biased;

            item = outbound_rx.recv() => {
                let Some(item) = item else {
                    let _ = tokio::time::timeout(config.write_wait, sender.send(Message::Close(None))).await;
                    return;
                };
                let frame = match item {
                    Outbound::Raw(text) => Message::Text(text),
                    Outbound::Shared(text) => Message::Text((*text).clone()),
                    Outbound::Close { code, reason } => {
                        let _ = tokio::time::timeout(
                            config.write_wait,
                            sender.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))),
                        )
                        .await;
                        return;
                    }
                };
                match tokio::time::timeout(config.write_wait, sender.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }

            () = token.cancelled() => {
                let _ = tokio::time::timeout(config.write_wait, sender.send(Message::Close(None))).await;
                return;
            }

            _ = ticker.tick() => {
                match tokio::time::timeout(config.write_wait, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
        }
    }
}
