//! # fencelink Daemon Library
//!
//! This crate executes home-automation actions when the device enters or
//! leaves a geofence, including when the process was woken in the background
//! with nothing loaded yet.
//!
//! ## Overview
//!
//! - **Dispatch**: gate a trigger on its active window and the account's
//!   entitlement, then run every configured action concurrently
//! - **Transports**: cloud API with transparent token refresh, and a LAN
//!   client with a hard probe deadline
//! - **Retries**: bounded per-job backoff with a user notification on failure
//! - **Gateways**: UDP discovery and reachability testing
//! - **Headless gate**: hold triggers until persisted state is loaded and
//!   never process the same event twice
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Delivery Orchestrator                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────────────┐  │
//! │  │   Geofence   │──▶│   Headless   │──▶│   Action Dispatcher   │  │
//! │  │   Monitor    │   │ Trigger Gate │   │                       │  │
//! │  └──────────────┘   └──────────────┘   └───────────┬───────────┘  │
//! │                                                    │              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────▼───────────┐  │
//! │  │  Discovery   │   │ Reachability │   │ Cloud Client │ Retry  │  │
//! │  │ Broadcaster  │   │    Tester    │   │              │ Queue  │  │
//! │  └──────────────┘   └──────────────┘   └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DeliveryOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = DeliveryOrchestrator::from_config(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`clock`]: Cancellable timers
//! - [`transport`]: Cloud and local HTTP clients
//! - [`gateways`]: Gateway registry, reachability and discovery
//! - [`retry`]: Bounded retry queue
//! - [`dispatcher`]: Fence action execution
//! - [`gate`]: Headless trigger gate
//! - [`monitoring`]: Geofence monitoring
//! - [`store`]: Account persistence and readiness
//! - [`notify`]: User notifications
//! - [`orchestrator`]: Main coordinator

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod gate;
pub mod gateways;
pub mod monitoring;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use clock::{CancelToken, Clock, ManualClock, ThreadClock, TokioClock};
pub use config::{Config, ConfigError};
pub use dispatcher::{ActionDispatcher, DeliveryEvent, DispatchReport, JobOutcome, SkipReason};
pub use gate::{GateOutcome, HeadlessTriggerGate, TriggerHandler};
pub use gateways::{DiscoveryBroadcaster, GatewayRegistry, ReachabilityOutcome, ReachabilityTester};
pub use monitoring::{
    GeofenceEngine, GeofenceMonitor, GeofenceSpec, InProcessGeofenceEngine, MonitoringConfig,
    MonitoringState,
};
pub use notify::{LogNotifier, Notification, Notifier};
pub use orchestrator::{Collaborators, DeliveryOrchestrator, OrchestratorEvent, OrchestratorState};
pub use retry::{RetryDecision, RetryQueue};
pub use store::{
    AccountStore, CloudTokenIssuer, FileAccountStore, LocalTokenIssuer, MemoryAccountStore,
    ReadinessFlag, StoreReadiness,
};
pub use transport::{CloudClient, LocalClient, SessionProvider, Transport};
