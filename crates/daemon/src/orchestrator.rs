//! Delivery orchestrator for wiring together all components.
//!
//! This module provides the `DeliveryOrchestrator` that initializes and
//! coordinates the delivery subsystems: account store, cloud client, gateway
//! registry, reachability testing, LAN discovery, retry queue, dispatcher,
//! headless trigger gate and geofence monitoring.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::FenceTrigger;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, TokioClock};
use crate::config::Config;
use crate::dispatcher::{ActionDispatcher, DeliveryEvent};
use crate::gate::{GateOutcome, HeadlessTriggerGate};
use crate::gateways::{DiscoveryBroadcaster, GatewayRegistry, ReachabilityOutcome, ReachabilityTester};
use crate::monitoring::{GeofenceEngine, GeofenceMonitor, InProcessGeofenceEngine};
use crate::notify::{LogNotifier, Notifier};
use crate::retry::RetryQueue;
use crate::store::{AccountStore, CloudTokenIssuer, FileAccountStore, ReadinessFlag, StoreReadiness};
use crate::transport::{CloudClient, SessionProvider};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and consuming geofence events.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A geofence trigger went through the gate.
    TriggerHandled { event_id: Uuid, outcome: GateOutcome },
    /// Forwarded from the dispatcher.
    Delivery(DeliveryEvent),
    /// A discovery reply was matched to a registered gateway.
    GatewayDiscovered { gateway_id: u64, address: String },
    /// A rediscovery and reachability sweep finished.
    MaintenanceCompleted { gateways: usize, reachable: usize },
    /// Error occurred.
    Error { message: String },
}

/// Collaborators the orchestrator does not build itself.
pub struct Collaborators {
    pub store: Arc<dyn AccountStore>,
    pub readiness: Arc<dyn StoreReadiness>,
    pub engine: Arc<dyn GeofenceEngine>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Delivery orchestrator that manages all subsystems.
pub struct DeliveryOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    readiness: Arc<dyn StoreReadiness>,
    cloud: Arc<CloudClient>,
    registry: Arc<GatewayRegistry>,
    reachability: Arc<ReachabilityTester>,
    discovery: Arc<DiscoveryBroadcaster>,
    retries: Arc<RetryQueue>,
    dispatcher: ActionDispatcher,
    gate: Arc<HeadlessTriggerGate>,
    monitor: Arc<GeofenceMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DeliveryOrchestrator {
    /// Creates an orchestrator backed by the on-disk account store.
    ///
    /// The store is loaded in the background; triggers that arrive before it
    /// finishes are held by the gate. Must be called inside a tokio runtime.
    pub fn from_config(config: Config) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .context("Orchestrator requires a tokio runtime")?;

        let store = Arc::new(FileAccountStore::new(config.account_store_path()));
        let readiness = ReadinessFlag::new(false);
        {
            let store = Arc::clone(&store);
            let readiness = readiness.clone();
            handle.spawn_blocking(move || {
                if let Err(e) = store.load() {
                    error!("Failed to load account store: {:#}", e);
                }
                readiness.mark_rehydrated();
            });
        }

        Self::new(
            config,
            Collaborators {
                store,
                readiness: Arc::new(readiness),
                engine: Arc::new(InProcessGeofenceEngine::new()),
                notifier: Arc::new(LogNotifier),
                clock: Arc::new(TokioClock::new(handle)),
            },
        )
    }

    /// Creates a new orchestrator from explicit collaborators.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let Collaborators {
            store,
            readiness,
            engine,
            notifier,
            clock,
        } = collaborators;

        let cloud = Arc::new(
            CloudClient::new(config.cloud.settings()?, Arc::clone(&store))
                .context("Failed to create cloud client")?,
        );

        let registry = Arc::new(GatewayRegistry::new());
        for gateway in &config.gateways {
            registry.register(gateway.to_state());
        }

        let shutdown_token = CancellationToken::new();

        let issuer = Arc::new(CloudTokenIssuer::new(
            Arc::clone(&cloud),
            config.cloud.account.clone(),
            config.cloud.local_token_path.clone(),
        ));
        let reachability = Arc::new(
            ReachabilityTester::new(Arc::clone(&registry), issuer)
                .with_timeout(config.local.probe_timeout())
                .with_probe_path(config.local.probe_path.clone())
                .with_cancellation(shutdown_token.child_token()),
        );

        let discovery = Arc::new(DiscoveryBroadcaster::new(
            Arc::clone(&registry),
            config.discovery.settings(),
        ));

        let retries =
            Arc::new(RetryQueue::new(clock, notifier).with_backoff(config.retry.backoff()));

        let sessions: Arc<dyn SessionProvider> = Arc::new(Arc::clone(&cloud));
        let dispatcher = ActionDispatcher::new(
            Arc::clone(&store),
            sessions,
            Arc::clone(&registry),
            Arc::clone(&retries),
        );

        let gate = Arc::new(HeadlessTriggerGate::new(
            Arc::clone(&readiness),
            Arc::new(dispatcher.clone()),
        ));
        let monitor = Arc::new(GeofenceMonitor::new(engine));

        let (event_tx, _) = broadcast::channel(256);

        info!(
            api_server = %config.cloud.api_server,
            gateways = registry.len(),
            retry_bound = retries.bound(),
            "Delivery orchestrator created"
        );

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            readiness,
            cloud,
            registry,
            reachability,
            discovery,
            retries,
            dispatcher,
            gate,
            monitor,
            tasks: Mutex::new(Vec::new()),
            shutdown_token,
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cloud(&self) -> &Arc<CloudClient> {
        &self.cloud
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub fn reachability(&self) -> &Arc<ReachabilityTester> {
        &self.reachability
    }

    pub fn discovery(&self) -> &Arc<DiscoveryBroadcaster> {
        &self.discovery
    }

    pub fn retries(&self) -> &Arc<RetryQueue> {
        &self.retries
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &Arc<GeofenceMonitor> {
        &self.monitor
    }

    /// Resolves once the account store has been loaded.
    pub async fn wait_rehydrated(&self) {
        if self.readiness.is_rehydrated() {
            return;
        }
        let mut ready = self.readiness.subscribe();
        let _ = ready.wait_for(|rehydrated| *rehydrated).await;
    }

    /// Starts monitoring, event forwarding and periodic maintenance.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator was stopped and cannot be restarted");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting delivery orchestrator...");

        if let Err(e) = self
            .monitor
            .setup_monitoring(self.config.monitoring.clone())
            .await
        {
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e).context("Failed to set up geofence monitoring");
        }

        let mut tasks = Vec::new();
        tasks.push(self.spawn_geofence_loop());
        tasks.push(self.spawn_delivery_forwarding());
        if self.config.discovery.enabled {
            tasks.push(self.spawn_discovery_forwarding());
        }
        tasks.push(self.spawn_maintenance_loop());
        debug!(tasks = tasks.len(), "Background tasks started");
        lock(&self.tasks).extend(tasks);

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Delivery orchestrator started successfully");
        Ok(())
    }

    /// Entry point for a trigger delivered to a background invocation.
    pub async fn on_headless_trigger(&self, trigger: FenceTrigger) -> GateOutcome {
        let event_id = trigger.event_id;
        let outcome = self.gate.on_trigger(trigger).await;
        self.emit_event(OrchestratorEvent::TriggerHandled { event_id, outcome });
        outcome
    }

    /// Waits until no retry is pending. Returns false if `budget` ran out first.
    pub async fn wait_idle(&self, budget: Duration) -> bool {
        tokio::time::timeout(budget, self.retries.wait_empty())
            .await
            .is_ok()
    }

    /// Runs one rediscovery and reachability sweep.
    pub async fn run_maintenance(&self) -> Vec<(u64, ReachabilityOutcome)> {
        maintain(
            &self.discovery,
            self.config.discovery.enabled,
            &self.reachability,
            &self.event_tx,
        )
        .await
    }

    /// Stops the orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped && lock(&self.tasks).is_empty() {
                self.shutdown_token.cancel();
                self.release();
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping delivery orchestrator...");

        self.shutdown_token.cancel();
        self.release();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Delivery orchestrator stopped");
        Ok(())
    }

    fn release(&self) {
        self.gate.shutdown();
        let pending = self.retries.len();
        self.retries.cancel_all();
        self.discovery.close_socket();
        if pending > 0 {
            info!(pending, "Cancelled pending retries");
        }
    }

    fn spawn_geofence_loop(&self) -> JoinHandle<()> {
        let mut events = self.monitor.on_geofence_event();
        let gate = Arc::clone(&self.gate);
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Geofence loop received shutdown signal");
                        break;
                    }
                    received = events.recv() => match received {
                        Ok(trigger) => {
                            let gate = Arc::clone(&gate);
                            let event_tx = event_tx.clone();
                            tokio::spawn(async move {
                                let event_id = trigger.event_id;
                                let outcome = gate.on_trigger(trigger).await;
                                let _ = event_tx.send(OrchestratorEvent::TriggerHandled { event_id, outcome });
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Geofence events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_delivery_forwarding(&self) -> JoinHandle<()> {
        let mut events = self.dispatcher.subscribe();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            let _ = event_tx.send(OrchestratorEvent::Delivery(event));
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Delivery events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_discovery_forwarding(&self) -> JoinHandle<()> {
        let mut replies = self.discovery.subscribe();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = replies.recv() => match received {
                        Ok(found) => {
                            if let Some(gateway_id) = found.gateway_id {
                                let _ = event_tx.send(OrchestratorEvent::GatewayDiscovered {
                                    gateway_id,
                                    address: found.from.ip().to_string(),
                                });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_maintenance_loop(&self) -> JoinHandle<()> {
        let discovery = Arc::clone(&self.discovery);
        let enabled = self.config.discovery.enabled;
        let reachability = Arc::clone(&self.reachability);
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown_token.clone();
        let period = Duration::from_secs(self.config.daemon.maintenance_interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        maintain(&discovery, enabled, &reachability, &event_tx).await;
                    }
                }
            }
        })
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn maintain(
    discovery: &DiscoveryBroadcaster,
    discovery_enabled: bool,
    reachability: &ReachabilityTester,
    event_tx: &broadcast::Sender<OrchestratorEvent>,
) -> Vec<(u64, ReachabilityOutcome)> {
    if discovery_enabled {
        discovery.close_socket();
        if let Err(e) = discovery.auto_discover().await {
            warn!("Gateway discovery failed: {}", e);
            let _ = event_tx.send(OrchestratorEvent::Error {
                message: format!("discovery: {e}"),
            });
        }
    }

    let outcomes = reachability.test_all().await;
    let reachable = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == ReachabilityOutcome::Reachable)
        .count();
    debug!(gateways = outcomes.len(), reachable, "Maintenance sweep finished");
    let _ = event_tx.send(OrchestratorEvent::MaintenanceCompleted {
        gateways: outcomes.len(),
        reachable,
    });
    outcomes
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GatewayEntry;
    use crate::monitoring::GeofenceSpec;
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryAccountStore;
    use protocol::trigger::{EventAction, FenceExtras};
    use protocol::{FenceKind, LocationSnapshot};
    use tempfile::TempDir;

    struct Harness {
        orchestrator: DeliveryOrchestrator,
        engine: Arc<InProcessGeofenceEngine>,
        readiness: ReadinessFlag,
        _clock: ManualClock,
    }

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.cloud.api_server = "http://127.0.0.1:9".to_string();
        config.discovery.enabled = false;
        config
    }

    fn harness(config: Config, ready: bool) -> Harness {
        let engine = Arc::new(InProcessGeofenceEngine::new());
        let readiness = ReadinessFlag::new(ready);
        let clock = ManualClock::new();
        let orchestrator = DeliveryOrchestrator::new(
            config,
            Collaborators {
                store: Arc::new(MemoryAccountStore::new()),
                readiness: Arc::new(readiness.clone()),
                engine: engine.clone(),
                notifier: Arc::new(RecordingNotifier::new()),
                clock: Arc::new(clock.clone()),
            },
        )
        .unwrap();
        Harness {
            orchestrator,
            engine,
            readiness,
            _clock: clock,
        }
    }

    fn trigger() -> FenceTrigger {
        FenceTrigger::new("fence", FenceKind::Enter, FenceExtras::default())
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.gateways.push(GatewayEntry {
            id: 5,
            uuid: Some("u5".into()),
            address: None,
        });

        let h = harness(config, true);
        assert_eq!(h.orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(h.orchestrator.registry().ids(), vec![5]);
        assert_eq!(h.orchestrator.retries().bound(), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.retry.backoff_secs.clear();

        let result = DeliveryOrchestrator::new(
            config,
            Collaborators {
                store: Arc::new(MemoryAccountStore::new()),
                readiness: Arc::new(ReadinessFlag::new(true)),
                engine: Arc::new(InProcessGeofenceEngine::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                clock: Arc::new(ManualClock::new()),
            },
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(create_test_config(&temp_dir), true);
        let mut events = h.orchestrator.subscribe();

        h.orchestrator.start().await.unwrap();
        assert_eq!(h.orchestrator.state().await, OrchestratorState::Running);
        assert!(h.orchestrator.start().await.is_err());

        h.orchestrator.stop().await.unwrap();
        assert_eq!(h.orchestrator.state().await, OrchestratorState::Stopped);
        assert!(h.orchestrator.start().await.is_err());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_headless_trigger_dedup() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(create_test_config(&temp_dir), true);
        let trigger = trigger();

        // no actions configured: processed and skipped by the dispatcher
        assert_eq!(
            h.orchestrator.on_headless_trigger(trigger.clone()).await,
            GateOutcome::Processed
        );
        assert_eq!(
            h.orchestrator.on_headless_trigger(trigger).await,
            GateOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_stop_abandons_trigger_waiting_for_store() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(create_test_config(&temp_dir), false);
        let orchestrator = Arc::new(h.orchestrator);

        let waiting = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.on_headless_trigger(trigger()).await })
        };
        for _ in 0..100 {
            if h.readiness.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        orchestrator.stop().await.unwrap();
        assert_eq!(waiting.await.unwrap(), GateOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_geofence_events_reach_gate() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(create_test_config(&temp_dir), true);
        h.orchestrator.start().await.unwrap();
        let mut events = h.orchestrator.subscribe();

        let mut extras = FenceExtras {
            title: "Home".into(),
            owner_id: "nobody".into(),
            ..Default::default()
        };
        extras
            .arriving
            .events
            .insert("1".into(), EventAction { id: 1, active: true });
        h.orchestrator
            .monitor()
            .add_geofence(GeofenceSpec {
                id: "home".into(),
                latitude: 55.7047,
                longitude: 13.1910,
                radius_meters: 100.0,
                notify_on_entry: true,
                notify_on_exit: false,
                extras,
            })
            .await
            .unwrap();

        let raised = h.engine.update_location(LocationSnapshot {
            latitude: 55.7047,
            longitude: 13.1910,
            ..Default::default()
        });
        assert_eq!(raised.len(), 1);

        let handled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(OrchestratorEvent::TriggerHandled { event_id, outcome }) =
                    events.recv().await
                {
                    return (event_id, outcome);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(handled, (raised[0].event_id, GateOutcome::Processed));

        h.orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_without_gateways() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(create_test_config(&temp_dir), true);
        let mut events = h.orchestrator.subscribe();

        assert!(h.orchestrator.run_maintenance().await.is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(OrchestratorEvent::MaintenanceCompleted {
                gateways: 0,
                reachable: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_maintenance_clears_unconfigured_gateway() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.gateways.push(GatewayEntry {
            id: 1,
            uuid: None,
            address: None,
        });
        let h = harness(config, true);

        let outcomes = h.orchestrator.run_maintenance().await;
        assert_eq!(outcomes, vec![(1, ReachabilityOutcome::NotConfigured)]);
        assert!(!h.orchestrator.registry().get(1).unwrap().reachable);
    }

    #[tokio::test]
    async fn test_wait_idle_when_nothing_pending() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(create_test_config(&temp_dir), true);
        assert!(h.orchestrator.wait_idle(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_from_config_rehydrates_store() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator =
            DeliveryOrchestrator::from_config(create_test_config(&temp_dir)).unwrap();

        // missing account file: store loads empty and the gate opens
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.on_headless_trigger(trigger()),
        )
        .await
        .unwrap();
        assert_eq!(outcome, GateOutcome::Processed);
    }
}
