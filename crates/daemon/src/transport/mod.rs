//! HTTP transports.
//!
//! Both clients execute a [`protocol::ApiRequest`] and return the decoded JSON
//! body. The [`Transport`] trait is the seam the dispatcher and reachability
//! tester are written against.

pub mod cloud;
pub mod local;

pub use cloud::{CloudClient, CloudSession, CloudSettings};
pub use local::{LocalClient, DEFAULT_PROBE_TIMEOUT};

use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::{ApiFault, ApiRequest, DeliveryError, HttpMethod};
use serde_json::Value;

/// Executes API requests against one endpoint.
pub trait Transport: Send + Sync {
    fn execute<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, protocol::Result<Value>>;
}

/// Hands out a transport acting on behalf of an account.
pub trait SessionProvider: Send + Sync {
    fn session(&self, user_id: &str) -> Arc<dyn Transport>;
}

impl SessionProvider for Arc<CloudClient> {
    fn session(&self, user_id: &str) -> Arc<dyn Transport> {
        Arc::new(CloudClient::session(self, user_id))
    }
}

/// Maps a reqwest failure onto the delivery taxonomy.
pub(crate) fn map_http_error(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout(err.to_string())
    } else if err.is_decode() {
        DeliveryError::Deserialization(err.to_string())
    } else {
        DeliveryError::Transport(err.to_string())
    }
}

pub(crate) fn builder_for(
    http: &reqwest::Client,
    method: HttpMethod,
    url: url::Url,
) -> reqwest::RequestBuilder {
    match method {
        HttpMethod::Get => http.get(url),
        HttpMethod::Post => http.post(url),
    }
}

/// Reads a response body and classifies it.
///
/// Token rejections become [`DeliveryError::AuthExpired`]; any other `error`
/// field is terminal. A 5xx without a JSON error is transient.
pub(crate) async fn read_body(response: reqwest::Response) -> protocol::Result<Value> {
    let status = response.status();
    let text = response.text().await.map_err(map_http_error)?;

    let body = match serde_json::from_str::<Value>(&text) {
        Ok(body) => body,
        Err(_) if status.is_server_error() || status.as_u16() == 429 => {
            return Err(DeliveryError::Server {
                status: status.as_u16(),
                message: text,
            })
        }
        Err(e) if status.is_success() => return Err(DeliveryError::Deserialization(e.to_string())),
        Err(_) => return Err(DeliveryError::Api(format!("HTTP {status}: {text}"))),
    };

    match ApiFault::from_body(&body) {
        Some(ApiFault::TokenRejected(code)) => Err(DeliveryError::AuthExpired(code)),
        Some(ApiFault::Other(message)) => Err(DeliveryError::Api(message)),
        None if status.is_server_error() => Err(DeliveryError::Server {
            status: status.as_u16(),
            message: body.to_string(),
        }),
        None if !status.is_success() => Err(DeliveryError::Api(format!("HTTP {status}: {body}"))),
        None => Ok(body),
    }
}
