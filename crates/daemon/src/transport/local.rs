//! LAN client for a gateway's local API.
//!
//! Requests go to `http://{address}/api{path}` with the gateway's local token.
//! Every call owns its deadline: a timer is raced against the request and the
//! request future is dropped when the timer or an outside cancellation wins.

use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::{ApiRequest, DeliveryError};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{builder_for, map_http_error, read_body, Transport};

/// Hard deadline of a local call.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default lightweight probe path.
pub const DEFAULT_PROBE_PATH: &str = "/system/info";

#[derive(Debug, Clone)]
pub struct LocalClient {
    http: reqwest::Client,
    address: String,
    token: String,
    timeout: Duration,
    probe_path: String,
}

impl LocalClient {
    pub fn new(http: reqwest::Client, address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            address: address.into(),
            token: token.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn url(&self, path: &str) -> protocol::Result<Url> {
        Url::parse(&format!("http://{}/api{}", self.address, path)).map_err(|e| {
            DeliveryError::ConfigInvalid(format!("bad gateway address {}: {e}", self.address))
        })
    }

    /// Executes `request`, giving up at the deadline or when `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        request: &ApiRequest,
        cancel: &CancellationToken,
    ) -> protocol::Result<Value> {
        let url = self.url(&request.path)?;
        let call = async {
            let response = builder_for(&self.http, request.method, url)
                .query(&request.query)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(map_http_error)?;
            read_body(response).await
        };

        tokio::select! {
            result = call => result,
            _ = tokio::time::sleep(self.timeout) => {
                debug!(address = %self.address, timeout = ?self.timeout, "local call timed out");
                Err(DeliveryError::Timeout(format!(
                    "gateway {} did not answer within {:?}",
                    self.address, self.timeout
                )))
            }
            _ = cancel.cancelled() => {
                Err(DeliveryError::Transport(format!("call to {} cancelled", self.address)))
            }
        }
    }

    /// Issues the probe request.
    pub async fn probe(&self, cancel: &CancellationToken) -> protocol::Result<()> {
        let request = ApiRequest::get(self.probe_path.as_str());
        self.execute_cancellable(&request, cancel).await.map(|_| ())
    }
}

impl Transport for LocalClient {
    fn execute<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, protocol::Result<Value>> {
        Box::pin(async move {
            let cancel = CancellationToken::new();
            let _guard = cancel.clone().drop_guard();
            self.execute_cancellable(request, &cancel).await
        })
    }
}
