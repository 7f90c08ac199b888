//! Cloud API client with transparent token refresh.
//!
//! Requests go to `{api_server}/oauth2{path}` with the account's bearer
//! token. When the service answers `invalid_token` or `expired_token`, the
//! client exchanges the refresh token, stores the new credential and replays
//! the request once. Refreshes are serialized per account; a caller that
//! finds the rejected token already replaced reuses the newer one.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::{ApiRequest, Credential, DeliveryError, TokenResponse};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{builder_for, map_http_error, read_body, Transport};
use crate::clock::unix_now;
use crate::store::AccountStore;

/// Connection settings for the cloud service.
#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub api_server: Url,
    pub client_id: String,
    pub client_secret: String,
    pub request_timeout: Duration,
}

/// Shared cloud client for every account.
pub struct CloudClient {
    http: reqwest::Client,
    settings: CloudSettings,
    store: Arc<dyn AccountStore>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CloudClient {
    pub fn new(settings: CloudSettings, store: Arc<dyn AccountStore>) -> protocol::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| DeliveryError::ConfigInvalid(format!("http client: {e}")))?;
        Ok(Self::with_http(http, settings, store))
    }

    pub fn with_http(
        http: reqwest::Client,
        settings: CloudSettings,
        store: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            http,
            settings,
            store,
            refresh_locks: DashMap::new(),
        }
    }

    /// A transport bound to one account.
    pub fn session(self: &Arc<Self>, user_id: impl Into<String>) -> CloudSession {
        CloudSession {
            client: Arc::clone(self),
            user_id: user_id.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    fn url(&self, path: &str) -> protocol::Result<Url> {
        let base = self.settings.api_server.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/oauth2{path}"))
            .map_err(|e| DeliveryError::ConfigInvalid(format!("bad api url for {path}: {e}")))
    }

    async fn send(&self, request: &ApiRequest, access_token: &str) -> protocol::Result<Value> {
        let url = self.url(&request.path)?;
        let response = builder_for(&self.http, request.method, url)
            .query(&request.query)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(map_http_error)?;
        read_body(response).await
    }

    /// Executes `request` as `user_id`, refreshing the token at most once.
    pub async fn call(&self, user_id: &str, request: &ApiRequest) -> protocol::Result<Value> {
        let credential = self
            .store
            .get_account_token(user_id)
            .ok_or_else(|| DeliveryError::MissingToken {
                user_id: user_id.to_string(),
            })?;

        match self.send(request, &credential.access_token).await {
            Err(DeliveryError::AuthExpired(code)) => {
                debug!(user_id, path = %request.path, %code, "access token rejected");
                let refreshed = self.refresh(user_id, &credential.access_token).await?;
                match self.send(request, &refreshed.access_token).await {
                    Err(DeliveryError::AuthExpired(code)) => Err(DeliveryError::SessionInvalid(
                        format!("token rejected after refresh: {code}"),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Replaces the rejected access token, or returns the token that already did.
    async fn refresh(&self, user_id: &str, rejected: &str) -> protocol::Result<Credential> {
        let lock = self
            .refresh_locks
            .entry(user_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let current = self
            .store
            .get_account_token(user_id)
            .ok_or_else(|| DeliveryError::MissingToken {
                user_id: user_id.to_string(),
            })?;
        if current.access_token != rejected {
            debug!(user_id, "token already refreshed by another caller");
            return Ok(current);
        }

        let credential = self.exchange(&current).await.map_err(|reason| {
            warn!(user_id, %reason, "token refresh failed");
            DeliveryError::SessionInvalid(reason)
        })?;

        self.store
            .set_account_token(user_id, credential.clone())
            .map_err(|e| DeliveryError::SessionInvalid(format!("storing refreshed token: {e:#}")))?;
        info!(user_id, "access token refreshed");
        Ok(credential)
    }

    async fn exchange(&self, current: &Credential) -> Result<Credential, String> {
        let url = self.url("/accessToken").map_err(|e| e.to_string())?;
        let body = json!({
            "client_id": self.settings.client_id,
            "client_secret": self.settings.client_secret,
            "grant_type": "refresh_token",
            "refresh_token": current.refresh_token,
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("refresh request failed: {e}"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("refresh response unreadable: {e}"))?;
        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|_| format!("refresh answered HTTP {status}: {text}"))?;
        if !status.is_success() && token.error.is_none() {
            return Err(format!("refresh answered HTTP {status}"));
        }
        token.into_credential(current, unix_now())
    }
}

/// Cloud transport bound to one account.
#[derive(Clone)]
pub struct CloudSession {
    client: Arc<CloudClient>,
    user_id: String,
}

impl CloudSession {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Transport for CloudSession {
    fn execute<'a>(&'a self, request: &'a ApiRequest) -> BoxFuture<'a, protocol::Result<Value>> {
        Box::pin(self.client.call(&self.user_id, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAccountStore;
    use mockito::Matcher;

    const REJECTED: &str = r#"{"error": "expired_token"}"#;
    const OK: &str = r#"{"status": "success"}"#;

    fn settings(server: &mockito::Server) -> CloudSettings {
        CloudSettings {
            api_server: Url::parse(&server.url()).unwrap(),
            client_id: "client".into(),
            client_secret: "secret".into(),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn client(server: &mockito::Server, store: Arc<MemoryAccountStore>) -> Arc<CloudClient> {
        Arc::new(CloudClient::new(settings(server), store).unwrap())
    }

    fn device_on() -> ApiRequest {
        ApiRequest::get("/device/command").param("id", 1).param("method", 1)
    }

    #[tokio::test]
    async fn test_call_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::UrlEncoded("id".into(), "1".into()))
            .match_header("authorization", "Bearer access")
            .with_status(200)
            .with_body(OK)
            .create_async()
            .await;

        let store = Arc::new(MemoryAccountStore::new().with_account("u", Credential::new("access", "r")));
        let body = client(&server, store.clone())
            .call("u", &device_on())
            .await
            .unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(store.token_writes(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_token() {
        let server = mockito::Server::new_async().await;
        let store = Arc::new(MemoryAccountStore::new());
        let err = client(&server, store).call("nobody", &device_on()).await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::MissingToken {
                user_id: "nobody".into()
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_is_transparent() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer old")
            .with_status(200)
            .with_body(REJECTED)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/oauth2/accessToken")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "client_id": "client",
                "client_secret": "secret",
                "grant_type": "refresh_token",
                "refresh_token": "refresh-1",
            })))
            .with_status(200)
            .with_body(r#"{"access_token": "new", "refresh_token": "refresh-2", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;
        let replay = server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body(OK)
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(MemoryAccountStore::new().with_account("u", Credential::new("old", "refresh-1")));
        let body = client(&server, store.clone())
            .call("u", &device_on())
            .await
            .unwrap();

        assert_eq!(body["status"], "success");
        assert_eq!(store.token_writes(), 1);
        let stored = store.get_account_token("u").unwrap();
        assert_eq!(stored.access_token, "new");
        assert_eq!(stored.refresh_token, "refresh-2");
        rejected.assert_async().await;
        refresh.assert_async().await;
        replay.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_is_session_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(REJECTED)
            .create_async()
            .await;
        server
            .mock("POST", "/oauth2/accessToken")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryAccountStore::new().with_account("u", Credential::new("old", "r")));
        let err = client(&server, store.clone())
            .call("u", &device_on())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::SessionInvalid(_)), "{err:?}");
        assert_eq!(store.token_writes(), 0);
    }

    #[tokio::test]
    async fn test_second_rejection_is_session_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(REJECTED)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/oauth2/accessToken")
            .with_status(200)
            .with_body(r#"{"access_token": "new"}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryAccountStore::new().with_account("u", Credential::new("old", "r")));
        let err = client(&server, store)
            .call("u", &device_on())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::SessionInvalid(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_other_error_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/oauth2/accessToken")
            .expect(0)
            .create_async()
            .await;
        server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error": "Device not found"}"#)
            .create_async()
            .await;

        let store = Arc::new(MemoryAccountStore::new().with_account("u", Credential::new("a", "r")));
        let err = client(&server, store)
            .call("u", &device_on())
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Api("Device not found".into()));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let store = Arc::new(MemoryAccountStore::new().with_account("u", Credential::new("a", "r")));
        let err = client(&server, store)
            .call("u", &device_on())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, DeliveryError::Server { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_rejections_refresh_once() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer old")
            .with_status(200)
            .with_body(REJECTED)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/oauth2/accessToken")
            .with_status(200)
            .with_body(r#"{"access_token": "new"}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/oauth2/device/command")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body(OK)
            .create_async()
            .await;

        let store = Arc::new(MemoryAccountStore::new().with_account("u", Credential::new("old", "r")));
        let cloud = client(&server, store.clone());
        let request = device_on();
        let (a, b) = tokio::join!(cloud.call("u", &request), cloud.call("u", &request));
        assert!(a.is_ok() && b.is_ok(), "{a:?} {b:?}");
        assert_eq!(store.token_writes(), 1);
        refresh.assert_async().await;
    }
}
