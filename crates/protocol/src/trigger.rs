//! Geofence trigger payloads.
//!
//! A [`FenceTrigger`] is raised by the geofence monitoring service whenever
//! the device enters or leaves a user-defined area. The trigger carries the
//! complete action configuration of the fence in its `extras`, so a headless
//! process can act on it without loading anything else.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction in which a fence fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FenceKind {
    /// The device entered the area.
    Enter,
    /// The device left the area.
    Exit,
}

impl FenceKind {
    /// Human-readable direction, as used in user-facing text.
    pub fn direction(&self) -> &'static str {
        match self {
            FenceKind::Enter => "entering",
            FenceKind::Exit => "leaving",
        }
    }
}

impl fmt::Display for FenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.direction())
    }
}

/// Position reported together with a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocationSnapshot {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// RFC 3339 timestamp as reported by the location provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Time-of-day window during which a fence is allowed to fire.
///
/// The check is a plain minute-of-day comparison in local device time. A
/// window whose start lies after its end (crossing midnight) is never open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActiveWindow {
    pub is_always_active: bool,
    pub from_hr: u32,
    pub from_min: u32,
    pub to_hr: u32,
    pub to_min: u32,
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self {
            is_always_active: true,
            from_hr: 0,
            from_min: 0,
            to_hr: 23,
            to_min: 59,
        }
    }
}

impl ActiveWindow {
    /// A window bounded by `from` and `to`, both inclusive.
    pub fn between(from_hr: u32, from_min: u32, to_hr: u32, to_min: u32) -> Self {
        Self {
            is_always_active: false,
            from_hr,
            from_min,
            to_hr,
            to_min,
        }
    }

    /// Rejects hours outside 0..24 and minutes outside 0..60 of a bounded window.
    pub fn validate(&self) -> crate::Result<()> {
        if self.is_always_active {
            return Ok(());
        }
        for (hr, min) in [(self.from_hr, self.from_min), (self.to_hr, self.to_min)] {
            if hr >= 24 || min >= 60 {
                return Err(crate::DeliveryError::ConfigInvalid(format!(
                    "active window time {hr}:{min:02} out of range"
                )));
            }
        }
        Ok(())
    }

    /// Returns whether the window is open at `minute_of_day` (0..1440).
    pub fn is_open_at(&self, minute_of_day: u32) -> bool {
        self.is_always_active
            || is_active(self.from_hr, self.from_min, self.to_hr, self.to_min, minute_of_day)
    }
}

/// Minute-of-day window check without wraparound handling.
pub fn is_active(from_hr: u32, from_min: u32, to_hr: u32, to_min: u32, now: u32) -> bool {
    let minute = |hr: u32, min: u32| hr.saturating_mul(60).saturating_add(min);
    if minute(from_hr, from_min) > now {
        return false;
    }
    if minute(to_hr, to_min) < now {
        return false;
    }
    true
}

/// Device command configured for a fence direction.
///
/// `state_values` is keyed by method code and carries the method's argument
/// (dim level, RGB colour, thermostat settings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAction {
    pub device_id: u64,
    pub method: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_values: BTreeMap<String, serde_json::Value>,
}

/// Event activation toggle configured for a fence direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAction {
    pub id: u64,
    pub active: bool,
}

/// Schedule (job) save configured for a fence direction.
///
/// Everything besides `id` and `active` is forwarded to the service as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleAction {
    pub id: u64,
    pub active: bool,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// All actions configured for one direction of a fence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FenceActions {
    pub devices: BTreeMap<String, DeviceAction>,
    pub events: BTreeMap<String, EventAction>,
    pub schedules: BTreeMap<String, ScheduleAction>,
}

impl FenceActions {
    /// Returns true when no action of any kind is configured.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.events.is_empty() && self.schedules.is_empty()
    }

    /// Total number of configured actions.
    pub fn len(&self) -> usize {
        self.devices.len() + self.events.len() + self.schedules.len()
    }
}

/// Fence configuration carried inside every trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FenceExtras {
    /// User-visible fence name.
    pub title: String,
    /// Account that owns the fence and its actions.
    pub owner_id: String,
    #[serde(flatten)]
    pub window: ActiveWindow,
    #[serde(default)]
    pub arriving: FenceActions,
    #[serde(default)]
    pub leaving: FenceActions,
}

impl FenceExtras {
    /// Returns the action set for the given direction.
    pub fn actions_for(&self, kind: FenceKind) -> &FenceActions {
        match kind {
            FenceKind::Enter => &self.arriving,
            FenceKind::Exit => &self.leaving,
        }
    }
}

/// An enter/exit event raised by geofence monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FenceTrigger {
    /// Unique per OS delivery; used for de-duplication.
    pub event_id: Uuid,
    pub kind: FenceKind,
    /// Identifier of the fence that fired.
    pub identifier: String,
    #[serde(default)]
    pub location: LocationSnapshot,
    pub extras: FenceExtras,
}

impl FenceTrigger {
    /// Creates a trigger with a fresh event id.
    pub fn new(identifier: impl Into<String>, kind: FenceKind, extras: FenceExtras) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            identifier: identifier.into(),
            location: LocationSnapshot::default(),
            extras,
        }
    }

    /// Attaches the position the trigger was raised at.
    pub fn with_location(mut self, location: LocationSnapshot) -> Self {
        self.location = location;
        self
    }

    /// Returns the action set configured for this trigger's direction.
    pub fn actions(&self) -> &FenceActions {
        self.extras.actions_for(self.kind)
    }

    /// Parses a trigger from its JSON representation.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let trigger: Self = serde_json::from_str(json)?;
        trigger.extras.window.validate()?;
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"{
        "eventId": "6b0a3c50-3f7e-4c61-9a49-0e4f0d2e7a11",
        "kind": "ENTER",
        "identifier": "fence-home",
        "location": { "latitude": 55.7, "longitude": 13.19, "accuracy": 12.5 },
        "extras": {
            "title": "Home",
            "ownerId": "user-42",
            "isAlwaysActive": false,
            "fromHr": 8, "fromMin": 0, "toHr": 17, "toMin": 30,
            "arriving": {
                "devices": {
                    "101": { "deviceId": 101, "method": 1 },
                    "102": { "deviceId": 102, "method": 16, "stateValues": { "16": 128 } }
                },
                "events": { "7": { "id": 7, "active": true } }
            },
            "leaving": {
                "schedules": { "9": { "id": 9, "active": false, "deviceId": 101, "hour": 6 } }
            }
        }
    }"##;

    #[test]
    fn test_parse_sample_trigger() {
        let trigger = FenceTrigger::from_json(SAMPLE).unwrap();

        assert_eq!(trigger.kind, FenceKind::Enter);
        assert_eq!(trigger.identifier, "fence-home");
        assert_eq!(trigger.extras.owner_id, "user-42");
        assert!(!trigger.extras.window.is_always_active);
        assert_eq!(trigger.extras.window.to_min, 30);
        assert_eq!(trigger.actions().devices.len(), 2);
        assert_eq!(trigger.actions().events.len(), 1);
        assert_eq!(trigger.location.accuracy, Some(12.5));

        let schedule = &trigger.extras.leaving.schedules["9"];
        assert!(!schedule.active);
        assert_eq!(schedule.fields["hour"], serde_json::json!(6));
    }

    #[test]
    fn test_actions_follow_kind() {
        let mut trigger = FenceTrigger::from_json(SAMPLE).unwrap();
        assert_eq!(trigger.actions().len(), 3);

        trigger.kind = FenceKind::Exit;
        assert_eq!(trigger.actions().len(), 1);
        assert_eq!(trigger.actions().schedules.len(), 1);
    }

    #[test]
    fn test_missing_window_defaults_to_always_active() {
        let json = r#"{
            "eventId": "6b0a3c50-3f7e-4c61-9a49-0e4f0d2e7a12",
            "kind": "EXIT",
            "identifier": "f",
            "extras": { "title": "Office", "ownerId": "u" }
        }"#;
        let trigger = FenceTrigger::from_json(json).unwrap();
        assert!(trigger.extras.window.is_always_active);
        assert!(trigger.actions().is_empty());
    }

    #[test]
    fn test_kind_wire_format() {
        assert_eq!(serde_json::to_string(&FenceKind::Enter).unwrap(), "\"ENTER\"");
        assert_eq!(serde_json::to_string(&FenceKind::Exit).unwrap(), "\"EXIT\"");
        assert_eq!(FenceKind::Enter.to_string(), "entering");
        assert_eq!(FenceKind::Exit.to_string(), "leaving");
    }

    #[test]
    fn test_window_inside_and_outside() {
        let window = ActiveWindow::between(8, 0, 17, 0);
        assert!(window.is_open_at(12 * 60));
        assert!(window.is_open_at(8 * 60));
        assert!(window.is_open_at(17 * 60));
        assert!(!window.is_open_at(19 * 60));
        assert!(!window.is_open_at(7 * 60 + 59));
    }

    #[test]
    fn test_window_does_not_wrap_midnight() {
        // from 01:00 to 00:00 is never open under minute-of-day comparison
        assert!(!is_active(1, 0, 0, 0, 30));
        // a 22:00-06:00 window is closed at 23:30 as well
        assert!(!is_active(22, 0, 6, 0, 23 * 60 + 30));
    }

    #[test]
    fn test_out_of_range_window_rejected() {
        let json = r#"{
            "eventId": "6b0a3c50-3f7e-4c61-9a49-0e4f0d2e7a11",
            "kind": "ENTER",
            "identifier": "fence-home",
            "extras": {
                "title": "Home",
                "ownerId": "u",
                "isAlwaysActive": false,
                "fromHr": 4294967295,
                "fromMin": 0,
                "toHr": 23,
                "toMin": 59
            }
        }"#;
        let err = FenceTrigger::from_json(json).unwrap_err();
        assert!(matches!(err, crate::DeliveryError::ConfigInvalid(_)));

        assert!(ActiveWindow::between(8, 60, 17, 0).validate().is_err());
        assert!(ActiveWindow::between(8, 0, 24, 0).validate().is_err());
        assert!(ActiveWindow::between(0, 0, 23, 59).validate().is_ok());
    }

    #[test]
    fn test_huge_bounds_do_not_overflow() {
        let window = ActiveWindow::between(u32::MAX, u32::MAX, u32::MAX, 0);
        assert!(!window.is_open_at(30));
        assert!(is_active(0, 0, u32::MAX, u32::MAX, 30));
    }

    #[test]
    fn test_always_active_ignores_bounds() {
        let mut window = ActiveWindow::between(1, 0, 0, 0);
        window.is_always_active = true;
        assert!(window.is_open_at(30));
    }

    #[test]
    fn test_trigger_roundtrip_keeps_event_id() {
        let trigger = FenceTrigger::new("f1", FenceKind::Exit, FenceExtras::default());
        let json = serde_json::to_string(&trigger).unwrap();
        let parsed = FenceTrigger::from_json(&json).unwrap();
        assert_eq!(parsed.event_id, trigger.event_id);
        assert_eq!(parsed.kind, FenceKind::Exit);
    }
}
