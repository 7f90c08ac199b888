//! # Fencelink Protocol Library
//!
//! Data model and wire types for the fencelink action-delivery daemon.
//!
//! ## Overview
//!
//! The protocol crate holds everything that does not touch the network or a
//! timer:
//!
//! - **Triggers**: geofence enter/exit events and the action set they carry
//! - **Actions**: expansion of a trigger into independent jobs, each mapped to
//!   exactly one service request
//! - **Credentials**: account tokens, refresh responses and entitlement
//! - **Gateways**: local-control state and LAN discovery replies
//! - **Errors**: the delivery error taxonomy shared by every component
//!
//! ## Flow
//!
//! ```text
//! FenceTrigger ──expand──▶ ActionJob ─┬─▶ ApiRequest ──▶ transport
//!   (extras: window,                  │
//!    arriving/leaving)                └─▶ job_id (stable per action)
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{actions, FenceKind, FenceTrigger};
//! use protocol::trigger::{DeviceAction, FenceExtras};
//!
//! let mut extras = FenceExtras::default();
//! extras.owner_id = "user-1".into();
//! extras.arriving.devices.insert(
//!     "12".into(),
//!     DeviceAction { device_id: 12, method: 1, state_values: Default::default() },
//! );
//!
//! let trigger = FenceTrigger::new("home", FenceKind::Enter, extras);
//! let expanded = actions::expand(&trigger);
//! assert_eq!(expanded.jobs.len(), 1);
//! assert_eq!(expanded.jobs[0].payload.request().path, "/device/command");
//! ```
//!
//! ## Modules
//!
//! - [`trigger`]: Fence triggers, action sets and the active window
//! - [`actions`]: Jobs, payloads and request mapping
//! - [`credential`]: Account credentials and entitlement
//! - [`gateway`]: Gateway local state and discovery replies
//! - [`messages`]: Request shape and response fault classification
//! - [`geo`]: Haversine distance
//! - [`error`]: Error types

pub mod actions;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod geo;
pub mod messages;
pub mod trigger;

pub use actions::{ActionJob, ActionPayload, DevicePayload, EventToggle, JobKind, ScheduleSave};
pub use credential::{Credential, Entitlement, TokenResponse, UserProfile};
pub use error::{DeliveryError, ErrorClass, Result};
pub use gateway::{DiscoveryReply, GatewayLocalState, LocalTokenGrant, MalformedReply};
pub use messages::{ApiFault, ApiRequest, HttpMethod};
pub use trigger::{ActiveWindow, FenceActions, FenceExtras, FenceKind, FenceTrigger, LocationSnapshot};
