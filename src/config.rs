use serde::Deserialize;
use std::env;
use std::net::IpAddr;

use crate::climate::scale::{Precision, TemperatureUnit};
use crate::climate::table::{ModeRule, ModeTable};

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub tuya: TuyaConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct TuyaConfig {
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub key: String,
    pub ip: IpAddr,
    pub name: String,
    /// Sanitized name for use in MQTT topics (lowercase, spaces to underscores)
    pub topic_name: String,
    pub climate: ClimateConfig,
}

/// Which DPs carry the climate state and how raw values scale.
///
/// Only the power switch DP is mandatory; every other DP is optional and an
/// absent one simply leaves that feature unsupported.
#[derive(Debug, Clone)]
pub struct ClimateConfig {
    pub target_temperature_dp: Option<u32>,
    pub current_temperature_dp: Option<u32>,
    pub fan_mode_dp: Option<u32>,
    pub min_temp_dp: Option<u32>,
    pub max_temp_dp: Option<u32>,
    /// Scale of the current-temperature reading.
    pub precision: Precision,
    /// Scale of the target setpoint; independent of the reading scale.
    pub target_precision: Precision,
    pub temperature_step: f64,
    pub unit: TemperatureUnit,
    pub hvac_modes: ModeTable,
    pub presets: ModeTable,
}

// Serde structs for parsing the devices.json file
#[derive(Deserialize)]
struct RawDevice {
    id: String,
    key: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    name: Option<String>,
    climate: RawClimate,
}

#[derive(Deserialize)]
struct RawClimate {
    switch_dp: u32,
    #[serde(default)]
    target_temperature_dp: Option<u32>,
    #[serde(default)]
    current_temperature_dp: Option<u32>,
    #[serde(default)]
    hvac_mode_dp: Option<u32>,
    #[serde(default)]
    preset_dp: Option<u32>,
    #[serde(default)]
    fan_mode_dp: Option<u32>,
    #[serde(default)]
    min_temp_dp: Option<u32>,
    #[serde(default)]
    max_temp_dp: Option<u32>,
    #[serde(default)]
    precision: Option<f64>,
    #[serde(default)]
    target_precision: Option<f64>,
    #[serde(default)]
    temperature_step: Option<f64>,
    #[serde(default)]
    unit: Option<TemperatureUnit>,
    #[serde(default)]
    hvac_modes: Option<Vec<RawRule>>,
    #[serde(default)]
    presets: Option<Vec<RawRule>>,
}

/// One table entry as declared in devices.json:
/// `{ "name": "heat", "set": [[1, true], [4, "1"]] }`
/// The set is a list of pairs so declaration order survives parsing.
#[derive(Deserialize)]
struct RawRule {
    name: String,
    set: Vec<(u32, serde_json::Value)>,
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let content = std::fs::read_to_string(&devices_file)
            .map_err(|e| format!("Failed to read {devices_file}: {e}"))?;
        let devices = parse_devices(&content)
            .map_err(|e| format!("Failed to load {devices_file}: {e}"))?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", "thermostat".to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "tuya-thermostat-mqtt".to_string()),
            },
            tuya: TuyaConfig {
                poll_interval_secs: env_or_default("TUYA_POLL_INTERVAL_SECS", 30),
            },
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        if self.tuya.poll_interval_secs == 0 {
            return Err("TUYA_POLL_INTERVAL_SECS must be > 0".into());
        }
        Ok(())
    }

    pub fn device_status_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/bridge_status", self.mqtt.topic_prefix, topic_name)
    }

    pub fn device_command_topic(&self, topic_name: &str) -> String {
        format!("{}/{}/command/#", self.mqtt.topic_prefix, topic_name)
    }
}

fn parse_devices(content: &str) -> Result<Vec<DeviceConfig>, String> {
    let raw_devices: Vec<RawDevice> =
        serde_json::from_str(content).map_err(|e| format!("Invalid JSON: {e}"))?;

    raw_devices
        .into_iter()
        .map(|raw| {
            let ip: IpAddr = raw
                .ip
                .as_deref()
                .ok_or_else(|| format!("Device {} missing 'ip' field", raw.id))?
                .parse()
                .map_err(|e| format!("Device {} invalid IP: {e}", raw.id))?;

            let climate = build_climate_config(&raw.id, raw.climate)?;

            let name = raw.name.unwrap_or_else(|| raw.id.clone());
            let topic_name = sanitize_topic_name(&name);

            Ok(DeviceConfig {
                name,
                id: raw.id,
                key: raw.key,
                ip,
                topic_name,
                climate,
            })
        })
        .collect()
}

fn build_climate_config(device_id: &str, raw: RawClimate) -> Result<ClimateConfig, String> {
    let precision = parse_precision(device_id, "precision", raw.precision, Precision::Tenths)?;
    let target_precision = parse_precision(
        device_id,
        "target_precision",
        raw.target_precision,
        Precision::Whole,
    )?;

    let temperature_step = raw.temperature_step.unwrap_or(0.5);
    if temperature_step <= 0.0 {
        return Err(format!("Device {device_id}: temperature_step must be > 0"));
    }

    let hvac_modes = match raw.hvac_modes {
        Some(rules) => build_table(rules),
        None => default_mode_table(raw.switch_dp, raw.hvac_mode_dp),
    };
    let presets = match raw.presets {
        Some(rules) => build_table(rules),
        None => default_preset_table(raw.preset_dp),
    };

    Ok(ClimateConfig {
        target_temperature_dp: raw.target_temperature_dp,
        current_temperature_dp: raw.current_temperature_dp,
        fan_mode_dp: raw.fan_mode_dp,
        min_temp_dp: raw.min_temp_dp,
        max_temp_dp: raw.max_temp_dp,
        precision,
        target_precision,
        temperature_step,
        unit: raw.unit.unwrap_or_default(),
        hvac_modes,
        presets,
    })
}

fn parse_precision(
    device_id: &str,
    field: &str,
    value: Option<f64>,
    default: Precision,
) -> Result<Precision, String> {
    match value {
        None => Ok(default),
        Some(v) => Precision::from_multiplier(v)
            .ok_or_else(|| format!("Device {device_id}: {field} must be 1, 0.5 or 0.1")),
    }
}

fn build_table(rules: Vec<RawRule>) -> ModeTable {
    ModeTable::new(
        rules
            .into_iter()
            .map(|rule| ModeRule::new(rule.name, rule.set))
            .collect(),
    )
}

/// Mode table for the classic Tuya thermostat when none is declared:
/// power switch off ⇒ "off"; switch on ⇒ "heat", refined to "auto" when the
/// mode DP reports "auto". The switch-only "heat" rule comes first so that
/// any other mode string still decodes to heat via the last-match tie-break.
fn default_mode_table(switch_dp: u32, hvac_mode_dp: Option<u32>) -> ModeTable {
    use serde_json::json;

    let rules = match hvac_mode_dp {
        Some(mode_dp) => vec![
            ModeRule::new("off", vec![(switch_dp, json!(false))]),
            ModeRule::new("heat", vec![(switch_dp, json!(true))]),
            ModeRule::new(
                "auto",
                vec![(switch_dp, json!(true)), (mode_dp, json!("auto"))],
            ),
        ],
        None => vec![
            ModeRule::new("off", vec![(switch_dp, json!(false))]),
            ModeRule::new("heat", vec![(switch_dp, json!(true))]),
        ],
    };
    ModeTable::new(rules)
}

/// Eco presets on a boolean DP when no preset table is declared. Empty
/// table (preset unsupported) when no preset DP is configured either.
fn default_preset_table(preset_dp: Option<u32>) -> ModeTable {
    use serde_json::json;

    match preset_dp {
        Some(dp) => ModeTable::new(vec![
            ModeRule::new("eco-off", vec![(dp, json!(false))]),
            ModeRule::new("eco-on", vec![(dp, json!(true))]),
        ]),
        None => ModeTable::default(),
    }
}

/// Convert a device name into a safe MQTT topic segment.
/// "Hallway Thermostat" → "hallway_thermostat"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
