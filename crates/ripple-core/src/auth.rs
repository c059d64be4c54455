//! Authorization pipeline.
//!
//! Private and presence subscriptions are authorized by a remote callback
//! executed through a [`RequestDispatcher`]. The call is guarded by three
//! independent mechanisms: a hard timeout, a concurrency cap, and a circuit
//! breaker. Sign-in (`pusher:signin`) is verified locally against the
//! application secret with HMAC-SHA256.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use http::HeaderMap;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::breaker::CircuitBreaker;
use crate::client::Client;
use crate::metrics;

type HmacSha256 = Hmac<Sha256>;

/// Deadline for one remote authorization call.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Header naming the channel under authorization.
pub const CHANNEL_HEADER: &str = "X-FrankenPHP-WS-Channel";

/// Outcome of an authorization or sign-in check.
#[derive(Debug, Clone, Default)]
pub struct AuthResult {
    pub allowed: bool,
    /// Callback response body (authorize) or the verified payload (sign-in).
    pub user_data: Option<String>,
}

impl AuthResult {
    #[must_use]
    pub fn deny() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow(user_data: impl Into<String>) -> Self {
        Self {
            allowed: true,
            user_data: Some(user_data.into()),
        }
    }
}

/// Channel authorization and user sign-in verification.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authorize a subscription to a private or presence channel.
    async fn authorize(&self, client: &Client, channel: &str) -> AuthResult;

    /// Verify a `pusher:signin` signature.
    fn authenticate_user(&self, client: &Client, auth_sig: &str, user_data: &str) -> AuthResult;
}

/// An authorization request handed to the dispatcher.
#[derive(Debug)]
pub struct AuthCall {
    /// Request path (or absolute URL, dispatcher-dependent).
    pub path: String,
    /// Forwarded client headers plus the content negotiation headers.
    pub headers: HeaderMap,
    /// JSON body: `{channel_name, socket_id}`.
    pub body: Vec<u8>,
}

/// Dispatch errors. All of them count toward tripping the breaker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch failed: {0}")]
    Failed(String),
    /// The callback answered with a server error.
    #[error("callback status {0}")]
    CallbackStatus(u16),
}

/// Seam to the collaborator that actually runs the authorization callback.
///
/// Implementations write the response into the provided capture; the
/// capture enforces the response-size cap.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        call: AuthCall,
        capture: &mut ResponseCapture,
    ) -> Result<(), DispatchError>;
}

/// Size-capped response sink.
///
/// Once the cap is exceeded the overflow flag sticks and further writes are
/// discarded, so a misbehaving callback cannot balloon memory.
#[derive(Debug)]
pub struct ResponseCapture {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    overflow: bool,
    max_size: usize,
}

impl ResponseCapture {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            body: Vec::new(),
            overflow: false,
            max_size,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Append a response chunk, tripping the overflow flag at the cap.
    pub fn write(&mut self, chunk: &[u8]) {
        if self.overflow {
            return;
        }
        if self.body.len() + chunk.len() > self.max_size {
            self.overflow = true;
            return;
        }
        self.body.extend_from_slice(chunk);
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    fn reset(&mut self, max_size: usize) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.overflow = false;
        self.max_size = max_size;
    }
}

/// Pool of reusable captures.
#[derive(Debug, Default)]
struct CapturePool {
    free: Mutex<Vec<ResponseCapture>>,
}

impl CapturePool {
    fn get(&self, max_size: usize) -> ResponseCapture {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        match free.pop() {
            Some(mut capture) => {
                capture.reset(max_size);
                capture
            }
            None => ResponseCapture::new(max_size),
        }
    }

    fn put(&self, capture: ResponseCapture) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(capture);
    }
}

#[derive(Serialize)]
struct AuthBody<'a> {
    channel_name: &'a str,
    socket_id: &'a str,
}

/// The production [`AuthProvider`]: remote authorize through a dispatcher,
/// local HMAC sign-in verification.
pub struct DispatcherAuthProvider {
    dispatcher: Arc<dyn RequestDispatcher>,
    auth_path: String,
    secret: String,
    max_auth_body: usize,
    sem: Semaphore,
    breaker: CircuitBreaker,
    pool: CapturePool,
}

impl DispatcherAuthProvider {
    pub fn new(
        dispatcher: Arc<dyn RequestDispatcher>,
        auth_path: impl Into<String>,
        secret: impl Into<String>,
        max_auth_body: usize,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = if max_concurrent == 0 { 100 } else { max_concurrent };
        Self {
            dispatcher,
            auth_path: auth_path.into(),
            secret: secret.into(),
            max_auth_body,
            sem: Semaphore::new(max_concurrent),
            breaker: CircuitBreaker::default(),
            pool: CapturePool::default(),
        }
    }

    async fn call_dispatcher(&self, client: &Client, channel: &str) -> Result<AuthResult, DispatchError> {
        let body = serde_json::to_vec(&AuthBody {
            channel_name: channel,
            socket_id: client.id(),
        })
        .map_err(|e| DispatchError::Failed(e.to_string()))?;

        let mut headers = client.headers().clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(channel) {
            headers.insert(CHANNEL_HEADER, value);
        }

        let call = AuthCall {
            path: self.auth_path.clone(),
            headers,
            body,
        };

        let mut capture = self.pool.get(self.max_auth_body);
        let dispatched = tokio::time::timeout(AUTH_TIMEOUT, self.dispatcher.dispatch(call, &mut capture)).await;

        let outcome = match dispatched {
            Err(_elapsed) => Err(DispatchError::Failed("authorization call timed out".into())),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                if capture.overflowed() {
                    metrics::record_auth_failure("body_overflow");
                    warn!(channel = %channel, "auth response body too large");
                    Ok(AuthResult::deny())
                } else if capture.status() >= 500 {
                    metrics::record_auth_failure("worker_error");
                    warn!(channel = %channel, status = capture.status(), "auth callback error");
                    Err(DispatchError::CallbackStatus(capture.status()))
                } else if capture.status() != 200 {
                    Ok(AuthResult::deny())
                } else {
                    let body = String::from_utf8_lossy(capture.body()).into_owned();
                    Ok(AuthResult::allow(body))
                }
            }
        };

        self.pool.put(capture);
        outcome
    }
}

#[async_trait]
impl AuthProvider for DispatcherAuthProvider {
    async fn authorize(&self, client: &Client, channel: &str) -> AuthResult {
        // No queueing: a full semaphore is an immediate deny so auth
        // backpressure cannot consume unbounded memory.
        let Ok(_permit) = self.sem.try_acquire() else {
            metrics::record_auth_failure("concurrency_limit");
            warn!(id = %client.id(), "auth concurrency limit reached");
            return AuthResult::deny();
        };

        if self.breaker.acquire().is_err() {
            metrics::record_breaker_open();
            return AuthResult::deny();
        }

        let start = Instant::now();
        let outcome = self.call_dispatcher(client, channel).await;
        metrics::record_auth_duration(start.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                self.breaker.record_success();
                result
            }
            Err(e) => {
                if matches!(e, DispatchError::Failed(_)) {
                    metrics::record_auth_failure("dispatch_error");
                }
                error!(id = %client.id(), channel = %channel, error = %e, "auth dispatch failed");
                self.breaker.record_failure();
                AuthResult::deny()
            }
        }
    }

    fn authenticate_user(&self, client: &Client, auth_sig: &str, user_data: &str) -> AuthResult {
        if self.secret.is_empty() {
            warn!("user authentication failed, no secret configured");
            return AuthResult::deny();
        }

        // Format: key:signature. The key portion is informational only;
        // a single application secret is assumed.
        let parts: Vec<&str> = auth_sig.split(':').collect();
        let [_key, signature] = parts[..] else {
            return AuthResult::deny();
        };

        let Ok(signature) = hex::decode(signature) else {
            return AuthResult::deny();
        };

        let to_sign = format!("{}::user::{}", client.id(), user_data);
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return AuthResult::deny();
        };
        mac.update(to_sign.as_bytes());

        if mac.verify_slice(&signature).is_ok() {
            AuthResult::allow(user_data)
        } else {
            warn!(id = %client.id(), "user signature mismatch");
            AuthResult::deny()
        }
    }
}

/// Sign a `pusher:signin` payload: hex HMAC-SHA256 of
/// `"{socket_id}::user::{user_data}"` under the application secret.
#[must_use]
pub fn sign_user(secret: &str, socket_id: &str, user_data: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{socket_id}::user::{user_data}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
