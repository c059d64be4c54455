//! End-to-end protocol tests: handshake, subscriptions, presence, sign-in,
//! client events, and the protocol error paths.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use ripple_core::auth::{
    sign_user, AuthCall, DispatchError, DispatcherAuthProvider, RequestDispatcher, ResponseCapture,
};
use ripple_server::handlers::{build_router, AppState};
use ripple_server::Config;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const SECRET: &str = "super-secret-key";

/// Stand-in for the authorization worker: denies `private-forbidden`,
/// returns presence channel data keyed by socket id, allows the rest.
struct MockWorker;

#[async_trait]
impl RequestDispatcher for MockWorker {
    async fn dispatch(
        &self,
        call: AuthCall,
        capture: &mut ResponseCapture,
    ) -> Result<(), DispatchError> {
        let body: Value = serde_json::from_slice(&call.body)
            .map_err(|e| DispatchError::Failed(e.to_string()))?;
        let channel = body["channel_name"].as_str().unwrap_or_default();
        let socket_id = body["socket_id"].as_str().unwrap_or_default();

        if channel == "private-forbidden" {
            capture.set_status(403);
            return Ok(());
        }

        capture.set_status(200);
        if channel.starts_with("presence-") {
            let channel_data = json!({
                "user_id": socket_id,
                "user_info": { "socket": socket_id },
            })
            .to_string();
            let response = json!({ "auth": "key:sig", "channel_data": channel_data }).to_string();
            capture.write(response.as_bytes());
        } else {
            capture.write(b"{}");
        }
        Ok(())
    }
}

/// Start a server on an ephemeral port and return the WebSocket URL.
async fn start_server(app_id: &str, mutate: impl FnOnce(&mut Config)) -> (String, CancellationToken) {
    let mut config = Config {
        app_id: app_id.to_string(),
        auth_path: "http://127.0.0.1:9/unused".to_string(),
        auth_script: "auth.php".to_string(),
        webhook_secret: Some(SECRET.to_string()),
        ..Config::default()
    };
    mutate(&mut config);

    let token = CancellationToken::new();
    let auth = Arc::new(DispatcherAuthProvider::new(
        Arc::new(MockWorker),
        &config.auth_path,
        SECRET,
        config.max_auth_body,
        config.max_concurrent_auth,
    ));
    let (state, _hub_handle) = AppState::with_auth(config, auth, &token).expect("server state");
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{addr}/ws"), token)
}

async fn connect(url: &str) -> WsStream {
    let (stream, _response) = connect_async(url).await.expect("websocket connect");
    stream
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("frame is JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Read the handshake and return the socket id.
async fn expect_handshake(ws: &mut WsStream) -> String {
    let frame = recv_json(ws).await;
    assert_eq!(frame["event"], "pusher:connection_established");
    let data: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    data["socket_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_handshake_carries_socket_id_and_activity_timeout() {
    let (url, token) = start_server("e2e-handshake", |_| {}).await;
    let mut ws = connect(&url).await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher:connection_established");
    let data: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["activity_timeout"], 108);

    let socket_id = data["socket_id"].as_str().unwrap();
    let (secs, nanos) = socket_id.split_once('.').expect("socket id format");
    assert!(secs.parse::<u64>().is_ok() && nanos.parse::<u32>().is_ok());

    token.cancel();
}

#[tokio::test]
async fn test_public_subscribe_succeeds() {
    let (url, token) = start_server("e2e-public", |_| {}).await;
    let mut ws = connect(&url).await;
    expect_handshake(&mut ws).await;

    send_json(&mut ws, json!({"event": "pusher:subscribe", "data": {"channel": "public-test"}})).await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(frame["channel"], "public-test");
    assert_eq!(frame["data"], "{}");

    token.cancel();
}

#[tokio::test]
async fn test_denied_subscription_yields_4009() {
    let (url, token) = start_server("e2e-denied", |_| {}).await;
    let mut ws = connect(&url).await;
    expect_handshake(&mut ws).await;

    send_json(
        &mut ws,
        json!({"event": "pusher:subscribe", "data": {"channel": "private-forbidden"}}),
    )
    .await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher:error");
    assert_eq!(frame["data"]["code"], 4009);
    assert_eq!(frame["data"]["message"], "Subscription to private-forbidden rejected");

    token.cancel();
}

#[tokio::test]
async fn test_authorized_private_subscribe() {
    let (url, token) = start_server("e2e-private", |_| {}).await;
    let mut ws = connect(&url).await;
    expect_handshake(&mut ws).await;

    send_json(&mut ws, json!({"event": "pusher:subscribe", "data": {"channel": "private-ok"}})).await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(frame["channel"], "private-ok");

    token.cancel();
}

#[tokio::test]
async fn test_presence_roster_and_member_added() {
    let (url, token) = start_server("e2e-presence", |_| {}).await;

    let mut first = connect(&url).await;
    let first_id = expect_handshake(&mut first).await;
    send_json(&mut first, json!({"event": "pusher:subscribe", "data": {"channel": "presence-room"}})).await;

    let frame = recv_json(&mut first).await;
    assert_eq!(frame["event"], "pusher_internal:subscription_succeeded");
    let data: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["presence"]["ids"][0], first_id.as_str());

    let mut second = connect(&url).await;
    let second_id = expect_handshake(&mut second).await;
    send_json(&mut second, json!({"event": "pusher:subscribe", "data": {"channel": "presence-room"}})).await;

    // The second client's roster includes both members.
    let frame = recv_json(&mut second).await;
    let data: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["presence"]["ids"].as_array().unwrap().len(), 2);

    // The first client observes the join.
    let frame = recv_json(&mut first).await;
    assert_eq!(frame["event"], "pusher_internal:member_added");
    let data: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["user_id"], second_id.as_str());

    // And the leave.
    second.close(None).await.unwrap();
    let frame = recv_json(&mut first).await;
    assert_eq!(frame["event"], "pusher_internal:member_removed");
    let data: Value = serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["user_id"], second_id.as_str());

    token.cancel();
}

#[tokio::test]
async fn test_garbage_then_ping_still_answers() {
    let (url, token) = start_server("e2e-garbage", |_| {}).await;
    let mut ws = connect(&url).await;
    expect_handshake(&mut ws).await;

    ws.send(Message::Text("{INVALID_JSON".to_string())).await.unwrap();
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher:error");
    assert_eq!(frame["data"]["code"], 4200);
    assert_eq!(frame["data"]["message"], "Invalid JSON format");

    send_json(&mut ws, json!({"event": "pusher:ping"})).await;
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher:pong");

    token.cancel();
}

#[tokio::test]
async fn test_signin_success() {
    let (url, token) = start_server("e2e-signin", |_| {}).await;
    let mut ws = connect(&url).await;
    let socket_id = expect_handshake(&mut ws).await;

    let user_data = r#"{"id":"123","name":"Test User"}"#;
    let signature = sign_user(SECRET, &socket_id, user_data);
    send_json(
        &mut ws,
        json!({
            "event": "pusher:signin",
            "data": { "auth": format!("test-app:{signature}"), "user_data": user_data },
        }),
    )
    .await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher:signin_success");
    assert_eq!(frame["data"]["user_data"], user_data);

    token.cancel();
}

#[tokio::test]
async fn test_signin_bad_signature_yields_4009() {
    let (url, token) = start_server("e2e-signin-bad", |_| {}).await;
    let mut ws = connect(&url).await;
    expect_handshake(&mut ws).await;

    send_json(
        &mut ws,
        json!({
            "event": "pusher:signin",
            "data": { "auth": "test-app:deadbeef", "user_data": "{}" },
        }),
    )
    .await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "pusher:error");
    assert_eq!(frame["data"]["code"], 4009);

    token.cancel();
}

#[tokio::test]
async fn test_binary_frame_closes_with_4003() {
    let (url, token) = start_server("e2e-binary", |_| {}).await;
    let mut ws = connect(&url).await;
    expect_handshake(&mut ws).await;

    ws.send(Message::Binary(vec![0x01, 0x02])).await.unwrap();

    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close frame")
            .expect("read error");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 4003);
            break;
        }
    }

    token.cancel();
}

#[tokio::test]
async fn test_over_capacity_closes_with_4100() {
    let (url, token) = start_server("e2e-capacity", |config| {
        config.max_connections = 1;
    }).await;

    let mut first = connect(&url).await;
    expect_handshake(&mut first).await;

    let mut second = connect(&url).await;
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), second.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without close frame")
            .expect("read error");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 4100);
            break;
        }
    }

    // The rejected connection was never counted; the first still works.
    send_json(&mut first, json!({"event": "pusher:ping"})).await;
    assert_eq!(recv_json(&mut first).await["event"], "pusher:pong");

    token.cancel();
}

#[tokio::test]
async fn test_unsupported_protocol_is_rejected_before_upgrade() {
    let (url, token) = start_server("e2e-protocol", |_| {}).await;

    let result = connect_async(format!("{url}?protocol=4")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected HTTP 400, got {other:?}"),
    }

    // Protocol 7 connects fine.
    let mut ws = connect(&format!("{url}?protocol=7")).await;
    expect_handshake(&mut ws).await;

    token.cancel();
}

#[tokio::test]
async fn test_client_events_reach_other_subscribers_only() {
    let (url, token) = start_server("e2e-client-events", |_| {}).await;

    let mut sender = connect(&url).await;
    expect_handshake(&mut sender).await;
    let mut receiver = connect(&url).await;
    expect_handshake(&mut receiver).await;

    for ws in [&mut sender, &mut receiver] {
        send_json(ws, json!({"event": "pusher:subscribe", "data": {"channel": "private-room"}})).await;
        assert_eq!(recv_json(ws).await["event"], "pusher_internal:subscription_succeeded");
    }

    send_json(
        &mut sender,
        json!({"event": "client-typing", "channel": "private-room", "data": {"on": true}}),
    )
    .await;

    let frame = recv_json(&mut receiver).await;
    assert_eq!(frame["event"], "client-typing");
    assert_eq!(frame["channel"], "private-room");
    assert_eq!(frame["data"], r#"{"on":true}"#);

    // The sender hears nothing back.
    send_json(&mut sender, json!({"event": "pusher:ping"})).await;
    assert_eq!(recv_json(&mut sender).await["event"], "pusher:pong");

    token.cancel();
}

#[tokio::test]
async fn test_publish_fans_out_and_unsubscribe_stops_delivery() {
    let app_id = "e2e-publish";
    let (url, token) = start_server(app_id, |_| {}).await;

    let mut stays = connect(&url).await;
    expect_handshake(&mut stays).await;
    let mut leaves = connect(&url).await;
    expect_handshake(&mut leaves).await;

    for ws in [&mut stays, &mut leaves] {
        send_json(ws, json!({"event": "pusher:subscribe", "data": {"channel": "cluster-test"}})).await;
        assert_eq!(recv_json(ws).await["event"], "pusher_internal:subscription_succeeded");
    }

    assert!(ripple_server::api::publish(app_id, "cluster-test", "cross-node-event", r#"{"from":"node1"}"#).await);
    for ws in [&mut stays, &mut leaves] {
        let frame = recv_json(ws).await;
        assert_eq!(frame["event"], "cross-node-event");
        assert_eq!(frame["data"], r#"{"from":"node1"}"#);
    }

    send_json(&mut leaves, json!({"event": "pusher:unsubscribe", "data": {"channel": "cluster-test"}})).await;
    // Let the unsubscribe drain through the hub before publishing again.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(ripple_server::api::publish(app_id, "cluster-test", "second", "{}").await);
    assert_eq!(recv_json(&mut stays).await["event"], "second");

    send_json(&mut leaves, json!({"event": "pusher:ping"})).await;
    assert_eq!(recv_json(&mut leaves).await["event"], "pusher:pong");

    token.cancel();
}
