//! Action jobs and their payloads.
//!
//! A trigger's configured actions are expanded once into independent
//! [`ActionJob`]s. Device method codes are decoded into a [`DevicePayload`]
//! at that point, so the retry path only ever replays a ready-made request.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DeliveryError, Result};
use crate::messages::ApiRequest;
use crate::trigger::{DeviceAction, EventAction, FenceKind, FenceTrigger, ScheduleAction};

/// Device method codes understood by the service.
pub mod methods {
    pub const TURN_ON: u32 = 1;
    pub const TURN_OFF: u32 = 2;
    pub const BELL: u32 = 4;
    pub const DIM: u32 = 16;
    pub const UP: u32 = 128;
    pub const DOWN: u32 = 256;
    pub const STOP: u32 = 512;
    pub const RGB: u32 = 1024;
    pub const THERMOSTAT: u32 = 2048;
}

/// Namespace for deterministic job identifiers.
const JOB_NAMESPACE: Uuid = Uuid::from_u128(0x5f0c_2d2e_8b7a_4f4e_9a61_3c1d_7e0b_a442);

/// Kind of work an [`ActionJob`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobKind {
    Device,
    Event,
    Schedule,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Device => f.write_str("device"),
            JobKind::Event => f.write_str("event"),
            JobKind::Schedule => f.write_str("schedule"),
        }
    }
}

/// Device command, decided from the configured method code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DevicePayload {
    /// A method without arguments (on, off, bell, up, down, stop).
    Simple { device_id: u64, method: u32 },
    /// Dim to `level` (0-255).
    Dimmer { device_id: u64, level: u8 },
    /// Set an RGB colour.
    Rgb {
        device_id: u64,
        red: u8,
        green: u8,
        blue: u8,
    },
    /// Change thermostat mode and/or setpoint.
    Thermostat {
        device_id: u64,
        mode: Option<String>,
        temperature: Option<f64>,
        scale: u8,
        change_mode: bool,
    },
}

impl DevicePayload {
    /// Decodes a configured device action.
    pub fn from_action(action: &DeviceAction) -> Result<Self> {
        let device_id = action.device_id;
        let state_value = action.state_values.get(&action.method.to_string());

        match action.method {
            methods::TURN_ON
            | methods::TURN_OFF
            | methods::BELL
            | methods::UP
            | methods::DOWN
            | methods::STOP => Ok(DevicePayload::Simple {
                device_id,
                method: action.method,
            }),
            methods::DIM => {
                let level = state_value
                    .and_then(value_as_u64)
                    .ok_or_else(|| invalid(device_id, "dim level missing"))?;
                let level = u8::try_from(level)
                    .map_err(|_| invalid(device_id, "dim level out of range"))?;
                Ok(DevicePayload::Dimmer { device_id, level })
            }
            methods::RGB => {
                let (red, green, blue) = state_value
                    .and_then(parse_rgb)
                    .ok_or_else(|| invalid(device_id, "rgb colour missing or malformed"))?;
                Ok(DevicePayload::Rgb {
                    device_id,
                    red,
                    green,
                    blue,
                })
            }
            methods::THERMOSTAT => {
                let settings = state_value
                    .and_then(Value::as_object)
                    .ok_or_else(|| invalid(device_id, "thermostat settings missing"))?;
                let mode = settings
                    .get("mode")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let temperature = settings
                    .get("temperature")
                    .and_then(value_as_f64)
                    .or_else(|| match (settings.get("setpoint"), mode.as_deref()) {
                        (Some(Value::Object(map)), Some(mode)) => {
                            map.get(mode).and_then(value_as_f64)
                        }
                        (Some(other), _) => value_as_f64(other),
                        _ => None,
                    });
                if mode.is_none() && temperature.is_none() {
                    return Err(invalid(device_id, "thermostat needs a mode or a setpoint"));
                }
                let scale = settings
                    .get("scale")
                    .and_then(value_as_u64)
                    .and_then(|s| u8::try_from(s).ok())
                    .unwrap_or(0);
                let change_mode = settings
                    .get("changeMode")
                    .map(|v| v.as_bool().unwrap_or_else(|| value_as_u64(v) == Some(1)))
                    .unwrap_or(true);
                Ok(DevicePayload::Thermostat {
                    device_id,
                    mode,
                    temperature,
                    scale,
                    change_mode,
                })
            }
            other => Err(invalid(device_id, &format!("unsupported method {other}"))),
        }
    }

    /// The device the command targets.
    pub fn device_id(&self) -> u64 {
        match self {
            DevicePayload::Simple { device_id, .. }
            | DevicePayload::Dimmer { device_id, .. }
            | DevicePayload::Rgb { device_id, .. }
            | DevicePayload::Thermostat { device_id, .. } => *device_id,
        }
    }

    /// Builds the service request for this command.
    pub fn request(&self) -> ApiRequest {
        match self {
            DevicePayload::Simple { device_id, method } => ApiRequest::get("/device/command")
                .param("id", device_id)
                .param("method", method),
            DevicePayload::Dimmer { device_id, level } => ApiRequest::get("/device/command")
                .param("id", device_id)
                .param("method", methods::DIM)
                .param("value", level),
            DevicePayload::Rgb {
                device_id,
                red,
                green,
                blue,
            } => ApiRequest::get("/device/rgb")
                .param("id", device_id)
                .param("r", red)
                .param("g", green)
                .param("b", blue),
            DevicePayload::Thermostat {
                device_id,
                mode,
                temperature,
                scale,
                change_mode,
            } => {
                let mut request = ApiRequest::get("/device/thermostat").param("id", device_id);
                if let Some(mode) = mode {
                    request = request.param("mode", mode);
                }
                if let Some(temperature) = temperature {
                    request = request.param("temperature", temperature);
                }
                request
                    .param("scale", scale)
                    .param("changeMode", u8::from(*change_mode))
            }
        }
    }
}

/// Event activation change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventToggle {
    pub event_id: u64,
    pub active: bool,
}

impl From<&EventAction> for EventToggle {
    fn from(action: &EventAction) -> Self {
        Self {
            event_id: action.id,
            active: action.active,
        }
    }
}

/// Schedule save with its full field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSave {
    pub schedule_id: u64,
    pub active: bool,
    pub fields: Vec<(String, String)>,
}

impl From<&ScheduleAction> for ScheduleSave {
    fn from(action: &ScheduleAction) -> Self {
        let fields = action
            .fields
            .iter()
            .filter_map(|(key, value)| query_value(value).map(|v| (key.clone(), v)))
            .collect();
        Self {
            schedule_id: action.id,
            active: action.active,
            fields,
        }
    }
}

/// What a job does, decided once at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "UPPERCASE")]
pub enum ActionPayload {
    Device(DevicePayload),
    Event(EventToggle),
    Schedule(ScheduleSave),
}

impl ActionPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            ActionPayload::Device(_) => JobKind::Device,
            ActionPayload::Event(_) => JobKind::Event,
            ActionPayload::Schedule(_) => JobKind::Schedule,
        }
    }

    /// Builds the service request that executes this payload.
    pub fn request(&self) -> ApiRequest {
        match self {
            ActionPayload::Device(device) => device.request(),
            ActionPayload::Event(toggle) => ApiRequest::get("/event/setEvent")
                .param("id", toggle.event_id)
                .param("active", u8::from(toggle.active)),
            ActionPayload::Schedule(save) => {
                let mut request = ApiRequest::get("/scheduler/setJob")
                    .param("id", save.schedule_id)
                    .param("active", u8::from(save.active));
                for (key, value) in &save.fields {
                    request = request.param(key.clone(), value);
                }
                request
            }
        }
    }
}

/// One unit of work expanded from a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionJob {
    pub job_id: Uuid,
    pub payload: ActionPayload,
    pub owner_user_id: String,
}

impl ActionJob {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    /// Deterministic id for an action of a fence direction.
    ///
    /// A later trigger for the same action reuses the id, which supersedes
    /// any retry still pending for it.
    pub fn derive_id(fence_id: &str, direction: FenceKind, kind: JobKind, key: &str) -> Uuid {
        let name = format!("{fence_id}/{direction}/{kind}/{key}");
        Uuid::new_v5(&JOB_NAMESPACE, name.as_bytes())
    }
}

/// Result of expanding a trigger into jobs.
#[derive(Debug, Default)]
pub struct ExpandedActions {
    pub jobs: Vec<ActionJob>,
    /// Actions that could not be turned into a job, with the reason.
    pub rejected: Vec<(String, DeliveryError)>,
}

/// Expands the trigger's action set for its direction into jobs.
pub fn expand(trigger: &FenceTrigger) -> ExpandedActions {
    let actions = trigger.actions();
    let owner = &trigger.extras.owner_id;
    let fence = &trigger.identifier;
    let mut expanded = ExpandedActions::default();

    for (key, action) in &actions.devices {
        match DevicePayload::from_action(action) {
            Ok(payload) => expanded.jobs.push(ActionJob {
                job_id: ActionJob::derive_id(fence, trigger.kind, JobKind::Device, key),
                payload: ActionPayload::Device(payload),
                owner_user_id: owner.clone(),
            }),
            Err(e) => expanded.rejected.push((format!("device/{key}"), e)),
        }
    }

    for (key, action) in &actions.events {
        expanded.jobs.push(ActionJob {
            job_id: ActionJob::derive_id(fence, trigger.kind, JobKind::Event, key),
            payload: ActionPayload::Event(action.into()),
            owner_user_id: owner.clone(),
        });
    }

    for (key, action) in &actions.schedules {
        expanded.jobs.push(ActionJob {
            job_id: ActionJob::derive_id(fence, trigger.kind, JobKind::Schedule, key),
            payload: ActionPayload::Schedule(action.into()),
            owner_user_id: owner.clone(),
        });
    }

    expanded
}

fn invalid(device_id: u64, reason: &str) -> DeliveryError {
    DeliveryError::ConfigInvalid(format!("device {device_id}: {reason}"))
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.round() as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts `"#rrggbb"` or `{ "r": .., "g": .., "b": .. }`.
fn parse_rgb(value: &Value) -> Option<(u8, u8, u8)> {
    match value {
        Value::String(s) => {
            let hex = s.trim().trim_start_matches('#');
            if hex.len() != 6 {
                return None;
            }
            let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
            Some((channel(0)?, channel(2)?, channel(4)?))
        }
        Value::Object(map) => {
            let channel = |k: &str| {
                map.get(k)
                    .and_then(value_as_u64)
                    .and_then(|c| u8::try_from(c).ok())
            };
            Some((channel("r")?, channel("g")?, channel("b")?))
        }
        _ => None,
    }
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Object(_) => None,
        Value::Bool(b) => Some(u8::from(*b).to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(query_value)
                .collect::<Vec<_>>()
                .join(","),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{FenceActions, FenceExtras};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn device(device_id: u64, method: u32, state: Option<Value>) -> DeviceAction {
        let mut state_values = BTreeMap::new();
        if let Some(state) = state {
            state_values.insert(method.to_string(), state);
        }
        DeviceAction {
            device_id,
            method,
            state_values,
        }
    }

    #[test]
    fn test_simple_methods() {
        for method in [methods::TURN_ON, methods::TURN_OFF, methods::BELL, methods::STOP] {
            let payload = DevicePayload::from_action(&device(5, method, None)).unwrap();
            assert_eq!(payload, DevicePayload::Simple { device_id: 5, method });
        }
    }

    #[test]
    fn test_dimmer_from_number_and_string() {
        let payload = DevicePayload::from_action(&device(3, methods::DIM, Some(json!(200)))).unwrap();
        assert_eq!(payload, DevicePayload::Dimmer { device_id: 3, level: 200 });

        let payload = DevicePayload::from_action(&device(3, methods::DIM, Some(json!("64")))).unwrap();
        assert_eq!(payload, DevicePayload::Dimmer { device_id: 3, level: 64 });
    }

    #[test]
    fn test_dimmer_out_of_range_rejected() {
        let err = DevicePayload::from_action(&device(3, methods::DIM, Some(json!(300)))).unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigInvalid(_)));

        let err = DevicePayload::from_action(&device(3, methods::DIM, None)).unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigInvalid(_)));
    }

    #[test]
    fn test_rgb_from_hex_and_object() {
        let payload =
            DevicePayload::from_action(&device(8, methods::RGB, Some(json!("#ff8000")))).unwrap();
        assert_eq!(
            payload,
            DevicePayload::Rgb {
                device_id: 8,
                red: 255,
                green: 128,
                blue: 0
            }
        );

        let payload = DevicePayload::from_action(&device(
            8,
            methods::RGB,
            Some(json!({"r": 1, "g": 2, "b": 3})),
        ))
        .unwrap();
        assert_eq!(payload.request().param_value("b"), Some("3"));
    }

    #[test]
    fn test_thermostat_setpoint_by_mode() {
        let payload = DevicePayload::from_action(&device(
            9,
            methods::THERMOSTAT,
            Some(json!({"mode": "heat", "setpoint": {"heat": 21.5, "cool": 18}})),
        ))
        .unwrap();
        match &payload {
            DevicePayload::Thermostat {
                mode, temperature, ..
            } => {
                assert_eq!(mode.as_deref(), Some("heat"));
                assert_eq!(*temperature, Some(21.5));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        let request = payload.request();
        assert_eq!(request.path, "/device/thermostat");
        assert_eq!(request.param_value("temperature"), Some("21.5"));
        assert_eq!(request.param_value("changeMode"), Some("1"));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let err = DevicePayload::from_action(&device(1, 4096, None)).unwrap_err();
        assert!(err.to_string().contains("unsupported method 4096"));
    }

    #[test]
    fn test_event_and_schedule_requests() {
        let event = ActionPayload::Event(EventToggle {
            event_id: 7,
            active: false,
        });
        let request = event.request();
        assert_eq!(request.path, "/event/setEvent");
        assert_eq!(request.param_value("active"), Some("0"));

        let mut fields = BTreeMap::new();
        fields.insert("hour".to_string(), json!(6));
        fields.insert("weekdays".to_string(), json!([1, 2, 3]));
        fields.insert("meta".to_string(), json!({"ignored": true}));
        let schedule = ScheduleAction {
            id: 11,
            active: true,
            fields,
        };
        let request = ActionPayload::Schedule((&schedule).into()).request();
        assert_eq!(request.path, "/scheduler/setJob");
        assert_eq!(request.param_value("id"), Some("11"));
        assert_eq!(request.param_value("active"), Some("1"));
        assert_eq!(request.param_value("weekdays"), Some("1,2,3"));
        assert_eq!(request.param_value("meta"), None);
    }

    #[test]
    fn test_expand_uses_trigger_direction() {
        let mut arriving = FenceActions::default();
        arriving
            .devices
            .insert("1".into(), device(1, methods::TURN_ON, None));
        arriving
            .devices
            .insert("2".into(), device(2, methods::DIM, None));
        arriving.events.insert(
            "4".into(),
            EventAction {
                id: 4,
                active: true,
            },
        );
        let extras = FenceExtras {
            title: "Home".into(),
            owner_id: "owner".into(),
            arriving,
            ..Default::default()
        };
        let trigger = FenceTrigger::new("fence-1", FenceKind::Enter, extras);

        let expanded = expand(&trigger);
        assert_eq!(expanded.jobs.len(), 2);
        assert_eq!(expanded.rejected.len(), 1);
        assert_eq!(expanded.rejected[0].0, "device/2");
        assert!(expanded.jobs.iter().all(|j| j.owner_user_id == "owner"));

        let exit = FenceTrigger {
            kind: FenceKind::Exit,
            ..trigger
        };
        assert!(expand(&exit).jobs.is_empty());
    }

    #[test]
    fn test_job_ids_are_stable_per_action() {
        let a = ActionJob::derive_id("fence", FenceKind::Enter, JobKind::Device, "1");
        let b = ActionJob::derive_id("fence", FenceKind::Enter, JobKind::Device, "1");
        let c = ActionJob::derive_id("fence", FenceKind::Exit, JobKind::Device, "1");
        let d = ActionJob::derive_id("fence", FenceKind::Enter, JobKind::Event, "1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
