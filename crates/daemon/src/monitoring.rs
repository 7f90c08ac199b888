//! Geofence monitoring.
//!
//! [`GeofenceMonitor`] is what collaborators call to configure monitoring and
//! register fences. The OS service behind it is a [`GeofenceEngine`];
//! [`InProcessGeofenceEngine`] implements one from plain location updates.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::geo::distance_km;
use protocol::trigger::FenceExtras;
use protocol::{DeliveryError, FenceKind, FenceTrigger, LocationSnapshot};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// How long a fence registration may wait for the engine's acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(8);

/// Options understood by the monitoring service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Minimum movement in meters before a location update is evaluated.
    pub distance_filter: f64,
    /// Minutes without movement before tracking pauses.
    pub stop_timeout: u32,
    /// Radius in meters within which fences are actively tracked.
    pub proximity_radius: f64,
    pub high_accuracy_mode: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            distance_filter: 10.0,
            stop_timeout: 5,
            proximity_radius: 1000.0,
            high_accuracy_mode: false,
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> protocol::Result<()> {
        if !self.distance_filter.is_finite() || self.distance_filter < 0.0 {
            return Err(DeliveryError::ConfigInvalid(
                "distance_filter must be a non-negative number of meters".into(),
            ));
        }
        if !self.proximity_radius.is_finite() || self.proximity_radius <= 0.0 {
            return Err(DeliveryError::ConfigInvalid(
                "proximity_radius must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Monitoring status after setup.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringState {
    pub enabled: bool,
    pub config: MonitoringConfig,
    pub fences: usize,
}

/// A fence to register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceSpec {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
    pub extras: FenceExtras,
}

impl GeofenceSpec {
    fn validate(&self) -> protocol::Result<()> {
        let invalid = |reason: &str| {
            Err(DeliveryError::ConfigInvalid(format!(
                "geofence {}: {reason}",
                self.id
            )))
        };
        if self.id.trim().is_empty() {
            return Err(DeliveryError::ConfigInvalid("geofence id is empty".into()));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return invalid("latitude out of range");
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return invalid("longitude out of range");
        }
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return invalid("radius must be positive");
        }
        if !self.notify_on_entry && !self.notify_on_exit {
            return invalid("neither entry nor exit is monitored");
        }
        if self.extras.owner_id.is_empty() {
            return invalid("owner is missing");
        }
        self.extras.window.validate()
    }
}

/// The platform monitoring service.
pub trait GeofenceEngine: Send + Sync {
    fn configure(&self, config: &MonitoringConfig) -> BoxFuture<'_, protocol::Result<MonitoringState>>;

    /// Registers a fence; resolves when the service acknowledges it.
    fn add(&self, spec: GeofenceSpec) -> BoxFuture<'_, protocol::Result<()>>;

    /// Returns whether the fence was registered.
    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, protocol::Result<bool>>;

    /// Triggers raised by the service.
    fn events(&self) -> broadcast::Receiver<FenceTrigger>;
}

/// Entry point for monitoring setup and fence registration.
pub struct GeofenceMonitor {
    engine: Arc<dyn GeofenceEngine>,
    ack_timeout: Duration,
}

impl GeofenceMonitor {
    pub fn new(engine: Arc<dyn GeofenceEngine>) -> Self {
        Self {
            engine,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub async fn setup_monitoring(&self, config: MonitoringConfig) -> protocol::Result<MonitoringState> {
        config.validate()?;
        let state = self.engine.configure(&config).await?;
        info!(
            distance_filter = config.distance_filter,
            proximity_radius = config.proximity_radius,
            high_accuracy = config.high_accuracy_mode,
            fences = state.fences,
            "geofence monitoring configured"
        );
        Ok(state)
    }

    pub async fn add_geofence(&self, spec: GeofenceSpec) -> protocol::Result<()> {
        spec.validate()?;
        if spec.extras.arriving.is_empty() && spec.extras.leaving.is_empty() {
            return Err(DeliveryError::NoAction { fence_id: spec.id });
        }

        let id = spec.id.clone();
        match tokio::time::timeout(self.ack_timeout, self.engine.add(spec)).await {
            Ok(result) => {
                result?;
                debug!(fence_id = %id, "geofence registered");
                Ok(())
            }
            Err(_) => Err(DeliveryError::Timeout(format!(
                "geofence {id} not acknowledged within {:?}",
                self.ack_timeout
            ))),
        }
    }

    pub async fn remove_geofence(&self, id: &str) -> protocol::Result<bool> {
        self.engine.remove(id).await
    }

    pub fn on_geofence_event(&self) -> broadcast::Receiver<FenceTrigger> {
        self.engine.events()
    }
}

struct TrackedFence {
    spec: GeofenceSpec,
    inside: bool,
}

/// Geofence engine fed with location updates.
///
/// A fence starts outside; the first update inside it raises ENTER.
pub struct InProcessGeofenceEngine {
    fences: DashMap<String, TrackedFence>,
    config: Mutex<Option<MonitoringConfig>>,
    last_location: Mutex<Option<LocationSnapshot>>,
    events: broadcast::Sender<FenceTrigger>,
}

impl Default for InProcessGeofenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessGeofenceEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            fences: DashMap::new(),
            config: Mutex::new(None),
            last_location: Mutex::new(None),
            events,
        }
    }

    pub fn fence_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.fences.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Evaluates a location update and publishes the resulting triggers.
    pub fn update_location(&self, location: LocationSnapshot) -> Vec<FenceTrigger> {
        let distance_filter = lock(&self.config)
            .as_ref()
            .map(|c| c.distance_filter)
            .unwrap_or(0.0);
        {
            let mut last = lock(&self.last_location);
            if let Some(previous) = last.as_ref() {
                let moved_m = distance_km(
                    previous.latitude,
                    previous.longitude,
                    location.latitude,
                    location.longitude,
                ) * 1000.0;
                if moved_m < distance_filter {
                    return Vec::new();
                }
            }
            *last = Some(location.clone());
        }

        let mut triggers = Vec::new();
        for mut fence in self.fences.iter_mut() {
            let spec = &fence.spec;
            let distance_m = distance_km(
                spec.latitude,
                spec.longitude,
                location.latitude,
                location.longitude,
            ) * 1000.0;
            let inside = distance_m <= spec.radius_meters;
            let kind = match (fence.inside, inside) {
                (false, true) if spec.notify_on_entry => Some(FenceKind::Enter),
                (true, false) if spec.notify_on_exit => Some(FenceKind::Exit),
                _ => None,
            };
            let trigger = kind.map(|kind| {
                FenceTrigger::new(spec.id.clone(), kind, spec.extras.clone())
                    .with_location(location.clone())
            });
            fence.inside = inside;
            if let Some(trigger) = trigger {
                triggers.push(trigger);
            }
        }

        for trigger in &triggers {
            debug!(fence_id = %trigger.identifier, kind = %trigger.kind, "geofence crossed");
            let _ = self.events.send(trigger.clone());
        }
        triggers
    }
}

impl GeofenceEngine for InProcessGeofenceEngine {
    fn configure(&self, config: &MonitoringConfig) -> BoxFuture<'_, protocol::Result<MonitoringState>> {
        *lock(&self.config) = Some(config.clone());
        let state = MonitoringState {
            enabled: true,
            config: config.clone(),
            fences: self.fences.len(),
        };
        Box::pin(async move { Ok(state) })
    }

    fn add(&self, spec: GeofenceSpec) -> BoxFuture<'_, protocol::Result<()>> {
        Box::pin(async move {
            self.fences.insert(
                spec.id.clone(),
                TrackedFence {
                    spec,
                    inside: false,
                },
            );
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, protocol::Result<bool>> {
        Box::pin(async move { Ok(self.fences.remove(id).is_some()) })
    }

    fn events(&self) -> broadcast::Receiver<FenceTrigger> {
        self.events.subscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
