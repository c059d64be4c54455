//! HTTP request dispatcher.
//!
//! The authorization callback runs in an external worker; this dispatcher
//! reaches it over HTTP, streaming the response body into the caller's
//! size-capped capture so an oversized response never materializes in
//! memory.

use async_trait::async_trait;
use ripple_core::auth::{AuthCall, DispatchError, RequestDispatcher, ResponseCapture};

/// Dispatches authorization calls to an HTTP upstream. `auth_path` is used
/// as the request URL, so it must be absolute when this dispatcher is in
/// play.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    /// Build a dispatcher with a connection pool sized to the worker count.
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(num_workers.max(1))
            .build()
            .expect("failed to build auth HTTP client");
        Self { client }
    }
}

#[async_trait]
impl RequestDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        call: AuthCall,
        capture: &mut ResponseCapture,
    ) -> Result<(), DispatchError> {
        let mut response = self
            .client
            .post(&call.path)
            .headers(call.headers)
            .body(call.body)
            .send()
            .await
            .map_err(|e| DispatchError::Failed(e.to_string()))?;

        capture.set_status(response.status().as_u16());
        *capture.headers_mut() = response.headers().clone();

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DispatchError::Failed(e.to_string()))?
        {
            capture.write(&chunk);
        }

        Ok(())
    }
}
