//! Gateway local control.
//!
//! This module provides:
//! - Registry of per-gateway local state
//! - Reachability testing over the LAN API
//! - UDP broadcast discovery

pub mod discovery;
pub mod reachability;
pub mod registry;

pub use discovery::{DiscoveredGateway, DiscoveryBroadcaster, DiscoverySettings, DISCOVERY_PORT};
pub use reachability::{ReachabilityOutcome, ReachabilityTester};
pub use registry::GatewayRegistry;
