pub mod engine;
pub mod scale;
pub mod table;

use std::collections::HashMap;

use thiserror::Error;

/// Latest known DP values for a device: dp_id → bool | string | integer.
/// Built up by merging each `dps` payload the device sends.
pub type Snapshot = HashMap<u32, serde_json::Value>;

/// A single datapoint write, ready to send to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DpWrite {
    pub dp_id: u32,
    pub value: serde_json::Value,
}

/// Running action derived from current vs. target temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvacAction {
    Heating,
    Idle,
}

impl HvacAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HvacAction::Heating => "heating",
            HvacAction::Idle => "idle",
        }
    }
}

/// Semantic climate state decoded from the DP snapshot.
///
/// Fields stay at their previous value when an update doesn't resolve them,
/// so a partial or ambiguous snapshot never blanks the state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClimateState {
    pub hvac_mode: Option<String>,
    pub preset: Option<String>,
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub hvac_action: Option<HvacAction>,
    pub min_temp: f64,
    pub max_temp: f64,
    pub fan_mode: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClimateError {
    #[error("unknown HVAC mode: {0}")]
    UnknownMode(String),

    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    /// The device config has no DP assigned for this feature.
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
}

/// A semantic command for one device, parsed from an MQTT payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ClimateCommand {
    SetHvacMode(String),
    SetPreset(String),
    SetTargetTemperature(f64),
    SetFanMode(String),
}

impl ClimateCommand {
    /// Parse a command from its topic field and payload.
    /// Returns None for unknown fields or an unparseable temperature.
    pub fn parse(field: &str, payload: &str) -> Option<Self> {
        match field {
            "hvac_mode" => Some(Self::SetHvacMode(payload.to_string())),
            "preset" => Some(Self::SetPreset(payload.to_string())),
            "target_temperature" => {
                payload.trim().parse().ok().map(Self::SetTargetTemperature)
            }
            "fan_mode" => Some(Self::SetFanMode(payload.to_string())),
            _ => None,
        }
    }
}
