use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::misc::serde::deserialise_timestamp;

/* === Definitions === */

/// Device type code reported in every status event.
pub const DEVICE_TYPE_FAN: u8 = 1;

/// Parameter key carrying the requested speed of a `SetSpeed` command.
pub const SPEED_PARAMETER: &str = "Value";

/// A request to change the behaviour of the device, as received from
/// either inbound channel.
///
/// The action is kept as a raw string so that an unknown action is still
/// accepted by the transport and rejected by the dispatcher instead.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(alias = "DeviceId")]
    pub device_id: String,
    #[serde(alias = "Action")]
    pub action: String,
    #[serde(default, alias = "Parameters")]
    pub parameters: Map<String, Value>,
    #[serde(
        default = "Utc::now",
        alias = "Timestamp",
        deserialize_with = "deserialise_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Action {
    Start,
    Stop,
    SetSpeed,
}

/// The inbound channel a command arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Source {
    #[strum(to_string = "REST")]
    Rest,
    #[strum(to_string = "queue")]
    Queue,
    #[strum(to_string = "local input")]
    Local,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownAction(String),
    #[error("Missing '{0}' parameter")]
    MissingParameter(&'static str),
    #[error("Invalid '{name}' parameter: {value}")]
    InvalidParameter { name: &'static str, value: String },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub device_id: String,
    pub device_type: u8,
    pub state: StateCode,
    pub timestamp: DateTime<Utc>,
    pub properties: Properties,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StateCode {
    Offline = 0,
    Idle = 1,
    Running = 2,
}

/// Live properties of a status event. Both are absent in the final
/// offline status, which serializes to an empty map.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Properties {
    #[serde(rename = "Speed", skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(rename = "IsRunning", skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    pub alarm_id: Uuid,
    pub device_id: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, Display)]
pub enum Severity {
    Warning,
    Critical,
}

/// Which inbound channels are active. Anything short of `Full` is a
/// degraded mode caused by a disabled or unreachable channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, Display)]
pub enum Mode {
    Full,
    RestOnly,
    QueueOnly,
    Standalone,
}

/* === Implementations === */

impl Mode {
    pub fn new(http: bool, queue: bool) -> Self {
        match (http, queue) {
            (true, true) => Mode::Full,
            (true, false) => Mode::RestOnly,
            (false, true) => Mode::QueueOnly,
            (false, false) => Mode::Standalone,
        }
    }

    pub fn is_degraded(&self) -> bool {
        *self != Mode::Full
    }
}

impl Command {
    pub fn new(device_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            action: action.into(),
            parameters: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_speed(self, speed: f64) -> Self {
        self.with_parameter(SPEED_PARAMETER, speed)
    }

    pub fn action(&self) -> Result<Action, CommandError> {
        self.action
            .trim()
            .parse()
            .map_err(|_| CommandError::UnknownAction(self.action.clone()))
    }

    /// Reads the requested speed, accepting either a JSON number or a
    /// numeric string.
    pub fn speed(&self) -> Result<f64, CommandError> {
        let value = self
            .parameters
            .get(SPEED_PARAMETER)
            .ok_or(CommandError::MissingParameter(SPEED_PARAMETER))?;

        let speed = match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        };

        speed.ok_or_else(|| CommandError::InvalidParameter {
            name: SPEED_PARAMETER,
            value: value.to_string(),
        })
    }
}

impl StatusEvent {
    pub fn offline(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: DEVICE_TYPE_FAN,
            state: StateCode::Offline,
            timestamp: Utc::now(),
            properties: Properties::default(),
        }
    }
}

impl From<StateCode> for u8 {
    fn from(code: StateCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for StateCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StateCode::Offline),
            1 => Ok(StateCode::Idle),
            2 => Ok(StateCode::Running),
            other => Err(format!("invalid state code {other}")),
        }
    }
}

impl AlarmEvent {
    pub fn new(device_id: impl Into<String>, message: String, severity: Severity) -> Self {
        Self {
            alarm_id: Uuid::new_v4(),
            device_id: device_id.into(),
            message,
            severity,
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_command_accepts_both_casings() {
        let camel: Command = serde_json::from_value(json!({
            "deviceId": "fan-001",
            "action": "SetSpeed",
            "parameters": { "Value": 2.5 },
        }))
        .unwrap();

        let pascal: Command = serde_json::from_value(json!({
            "DeviceId": "fan-001",
            "Action": "SetSpeed",
            "Parameters": { "Value": "2.5" },
            "Timestamp": "2024-05-01T12:00:00Z",
        }))
        .unwrap();

        assert_eq!(camel.device_id, "fan-001");
        assert_eq!(camel.speed(), Ok(2.5));
        assert_eq!(pascal.speed(), Ok(2.5));
        assert_eq!(pascal.action(), Ok(Action::SetSpeed));
    }

    #[test]
    fn test_command_timestamp_formats() {
        let parse = |timestamp: Value| -> Command {
            serde_json::from_value(json!({
                "DeviceId": "fan-001",
                "Action": "Start",
                "Timestamp": timestamp,
            }))
            .unwrap()
        };

        let noon = "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();

        assert_eq!(parse(json!("2024-05-01T12:00:00Z")).timestamp, noon);
        assert_eq!(parse(json!("2024-05-01T14:00:00+02:00")).timestamp, noon);
        assert_eq!(parse(json!("2024-05-01T12:00:00")).timestamp, noon);
        assert_eq!(
            parse(json!("2024-05-01T12:00:00.250")).timestamp,
            noon + chrono::Duration::milliseconds(250)
        );

        let before = Utc::now();

        for fallback in [json!("yesterday"), Value::Null] {
            assert!(parse(fallback).timestamp >= before);
        }
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(Command::new("a", "start").action(), Ok(Action::Start));
        assert_eq!(Command::new("a", "STOP").action(), Ok(Action::Stop));
        assert_eq!(Command::new("a", "setspeed").action(), Ok(Action::SetSpeed));

        assert_eq!(
            Command::new("a", "Explode").action(),
            Err(CommandError::UnknownAction("Explode".into()))
        );
    }

    #[test]
    fn test_speed_parameter_errors() {
        let missing = Command::new("a", "SetSpeed");
        assert_eq!(
            missing.speed(),
            Err(CommandError::MissingParameter(SPEED_PARAMETER))
        );

        let text = Command::new("a", "SetSpeed").with_parameter("Value", "fast");
        assert!(matches!(
            text.speed(),
            Err(CommandError::InvalidParameter { .. })
        ));

        let boolean = Command::new("a", "SetSpeed").with_parameter("Value", true);
        assert!(boolean.speed().is_err());
    }

    #[test]
    fn test_status_event_shape() {
        let status = StatusEvent {
            device_id: "fan-001".into(),
            device_type: DEVICE_TYPE_FAN,
            state: StateCode::Running,
            timestamp: Utc::now(),
            properties: Properties {
                speed: Some(1.5),
                is_running: Some(true),
            },
        };

        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(value["deviceId"], "fan-001");
        assert_eq!(value["deviceType"], 1);
        assert_eq!(value["state"], 2);
        assert_eq!(value["properties"], json!({ "Speed": 1.5, "IsRunning": true }));
    }

    #[test]
    fn test_offline_status_has_empty_properties() {
        let value = serde_json::to_value(StatusEvent::offline("fan-001")).unwrap();

        assert_eq!(value["state"], 0);
        assert_eq!(value["properties"], json!({}));
    }

    #[test]
    fn test_alarm_event_shape() {
        let alarm = AlarmEvent::new("fan-001", "too fast".into(), Severity::Critical);
        let value = serde_json::to_value(&alarm).unwrap();

        assert_eq!(value["severity"], "Critical");
        assert_eq!(value["acknowledged"], false);
        assert!(value["alarmId"].is_string());
    }

    #[test]
    fn test_mode_from_channels() {
        assert_eq!(Mode::new(true, true), Mode::Full);
        assert_eq!(Mode::new(true, false), Mode::RestOnly);
        assert_eq!(Mode::new(false, true), Mode::QueueOnly);
        assert_eq!(Mode::new(false, false), Mode::Standalone);

        assert!(!Mode::Full.is_degraded());
        assert!(Mode::RestOnly.is_degraded());
    }
}
