//! Local reachability testing.
//!
//! A gateway is usable for local control only while a probe on its cached
//! address succeeds. A failed probe forgets the address so a later discovery
//! has to find it again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use protocol::DeliveryError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::GatewayRegistry;
use crate::clock::unix_now;
use crate::store::LocalTokenIssuer;
use crate::transport::local::{LocalClient, DEFAULT_PROBE_PATH, DEFAULT_PROBE_TIMEOUT};

/// Result of testing one gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ReachabilityOutcome {
    /// The gateway is not registered.
    Unknown,
    /// No address or token cached; state was cleared.
    NotConfigured,
    /// The local token had expired and a new one was stored instead of probing.
    TokenRenewed,
    /// Renewing the expired token failed.
    RenewFailed(DeliveryError),
    Reachable,
    /// The probe failed; the address was cleared.
    Unreachable(DeliveryError),
}

pub struct ReachabilityTester {
    registry: Arc<GatewayRegistry>,
    issuer: Arc<dyn LocalTokenIssuer>,
    http: reqwest::Client,
    timeout: Duration,
    probe_path: String,
    cancel: CancellationToken,
}

impl ReachabilityTester {
    pub fn new(registry: Arc<GatewayRegistry>, issuer: Arc<dyn LocalTokenIssuer>) -> Self {
        Self {
            registry,
            issuer,
            http: reqwest::Client::new(),
            timeout: DEFAULT_PROBE_TIMEOUT,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
            cancel: CancellationToken::new(),
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

    /// Ties in-flight probes to an outside shutdown token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub async fn test_gateway(&self, gateway_id: u64) -> ReachabilityOutcome {
        let Some(state) = self.registry.get(gateway_id) else {
            return ReachabilityOutcome::Unknown;
        };

        let (Some(address), Some(token)) = (state.address.clone(), state.local_token.clone()) else {
            self.registry.update(gateway_id, |g| g.reachable = false);
            debug!(gateway_id, "no cached address or token");
            return ReachabilityOutcome::NotConfigured;
        };

        if state.token_expired_at(unix_now()) {
            return match self.issuer.issue_local_token(gateway_id).await {
                Ok(grant) => {
                    info!(gateway_id, address = %grant.address, "local token renewed");
                    self.registry.update(gateway_id, |g| g.apply_grant(&grant));
                    ReachabilityOutcome::TokenRenewed
                }
                Err(e) => {
                    warn!(gateway_id, error = %e, "local token renewal failed");
                    self.registry.update(gateway_id, |g| g.reachable = false);
                    ReachabilityOutcome::RenewFailed(e)
                }
            };
        }

        let client = LocalClient::new(self.http.clone(), address.as_str(), token)
            .with_timeout(self.timeout)
            .with_probe_path(self.probe_path.as_str());
        match client.probe(&self.cancel).await {
            Ok(()) => {
                debug!(gateway_id, %address, "gateway reachable");
                self.registry.update(gateway_id, |g| g.reachable = true);
                ReachabilityOutcome::Reachable
            }
            Err(e) => {
                info!(gateway_id, %address, error = %e, "gateway unreachable, clearing address");
                self.registry.update(gateway_id, |g| g.invalidate());
                ReachabilityOutcome::Unreachable(e)
            }
        }
    }

    /// Tests every registered gateway concurrently.
    pub async fn test_all(&self) -> Vec<(u64, ReachabilityOutcome)> {
        let ids = self.registry.ids();
        let outcomes = join_all(ids.iter().map(|id| self.test_gateway(*id))).await;
        ids.into_iter().zip(outcomes).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use protocol::{GatewayLocalState, LocalTokenGrant};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FixedIssuer {
        calls: AtomicUsize,
        failing: bool,
    }

    impl LocalTokenIssuer for FixedIssuer {
        fn issue_local_token(
            &self,
            _gateway_id: u64,
        ) -> BoxFuture<'_, protocol::Result<LocalTokenGrant>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing;
            Box::pin(async move {
                if failing {
                    return Err(protocol::DeliveryError::Transport("cloud unreachable".into()));
                }
                Ok(LocalTokenGrant {
                    address: "10.1.1.1".into(),
                    token: "fresh".into(),
                    ttl: unix_now() + 3600,
                })
            })
        }
    }

    fn gateway(id: u64, address: Option<&str>, ttl: u64) -> GatewayLocalState {
        GatewayLocalState {
            gateway_id: id,
            uuid: None,
            address: address.map(str::to_string),
            local_token: Some("tok".into()),
            token_ttl: Some(ttl),
            reachable: true,
        }
    }

    fn tester(registry: &Arc<GatewayRegistry>, issuer: &Arc<FixedIssuer>) -> ReachabilityTester {
        ReachabilityTester::new(Arc::clone(registry), Arc::clone(issuer) as Arc<dyn LocalTokenIssuer>)
            .with_timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_missing_address_clears_state() {
        let registry = Arc::new(GatewayRegistry::new());
        registry.register(gateway(1, None, unix_now() + 100));
        let issuer = Arc::new(FixedIssuer::default());

        let outcome = tester(&registry, &issuer).test_gateway(1).await;
        assert_eq!(outcome, ReachabilityOutcome::NotConfigured);
        assert!(!registry.get(1).unwrap().reachable);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_token_renews_instead_of_probing() {
        let registry = Arc::new(GatewayRegistry::new());
        registry.register(gateway(2, Some("192.0.2.1"), 1));
        let issuer = Arc::new(FixedIssuer::default());

        let outcome = tester(&registry, &issuer).test_gateway(2).await;
        assert_eq!(outcome, ReachabilityOutcome::TokenRenewed);
        let state = registry.get(2).unwrap();
        assert_eq!(state.local_token.as_deref(), Some("fresh"));
        assert_eq!(state.address.as_deref(), Some("10.1.1.1"));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_invalidates_address() {
        let registry = Arc::new(GatewayRegistry::new());
        // TEST-NET-1, never answers
        registry.register(gateway(3, Some("192.0.2.1:9"), unix_now() + 3600));
        let issuer = Arc::new(FixedIssuer::default());

        let outcome = tester(&registry, &issuer).test_gateway(3).await;
        assert!(matches!(outcome, ReachabilityOutcome::Unreachable(_)));
        let state = registry.get(3).unwrap();
        assert!(state.address.is_none());
        assert!(!state.reachable);

        // the old address is not tried again
        let outcome = tester(&registry, &issuer).test_gateway(3).await;
        assert_eq!(outcome, ReachabilityOutcome::NotConfigured);
        assert!(registry.get(3).unwrap().address.is_none());
    }

    #[tokio::test]
    async fn test_failed_renewal_marks_unreachable() {
        let registry = Arc::new(GatewayRegistry::new());
        registry.register(gateway(5, Some("192.0.2.1"), 1));
        let issuer = Arc::new(FixedIssuer {
            failing: true,
            ..Default::default()
        });

        let outcome = tester(&registry, &issuer).test_gateway(5).await;
        assert!(matches!(outcome, ReachabilityOutcome::RenewFailed(_)));
        let state = registry.get(5).unwrap();
        assert!(!state.reachable);
        assert_eq!(state.local_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_successful_probe_marks_reachable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/system/info")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let registry = Arc::new(GatewayRegistry::new());
        let mut state = gateway(4, Some(&server.host_with_port()), unix_now() + 3600);
        state.reachable = false;
        registry.register(state);
        let issuer = Arc::new(FixedIssuer::default());

        let outcomes = tester(&registry, &issuer).test_all().await;
        assert_eq!(outcomes, vec![(4, ReachabilityOutcome::Reachable)]);
        assert!(registry.get(4).unwrap().reachable);
    }

    #[tokio::test]
    async fn test_unknown_gateway() {
        let registry = Arc::new(GatewayRegistry::new());
        let issuer = Arc::new(FixedIssuer::default());
        assert_eq!(
            tester(&registry, &issuer).test_gateway(99).await,
            ReachabilityOutcome::Unknown
        );
    }
}
