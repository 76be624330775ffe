use std::time::Duration;

use rust_async_tuyapi::mesparse::CommandType;
use rust_async_tuyapi::tuyadevice::TuyaDevice;
use rust_async_tuyapi::{Payload, PayloadStruct};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::climate::engine::ClimateEngine;
use crate::climate::scale::Precision;
use crate::climate::{ClimateCommand, ClimateState, DpWrite, Snapshot};
use crate::config::{ClimateConfig, DeviceConfig};

use super::StateUpdate;

pub struct TuyaClient {
    config: DeviceConfig,
    engine: ClimateEngine,
    /// Latest known DP values, merged from every dps payload the device
    /// sends. Partial updates are the norm; the engine always decodes
    /// against the full merged snapshot.
    snapshot: Snapshot,
}

impl TuyaClient {
    pub fn new(config: DeviceConfig) -> Self {
        let engine = ClimateEngine::new(config.climate.clone());
        Self {
            config,
            engine,
            snapshot: Snapshot::new(),
        }
    }

    /// Main device loop. Connects, polls, handles commands, reconnects on failure.
    pub async fn run(
        &mut self,
        state_tx: mpsc::Sender<StateUpdate>,
        mut cmd_rx: mpsc::Receiver<ClimateCommand>,
        poll_interval: Duration,
    ) {
        let mut backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);

        loop {
            info!(
                "Connecting to device {} ({}) at {}",
                self.config.name, self.config.id, self.config.ip
            );

            match self.run_session(&state_tx, &mut cmd_rx, poll_interval).await {
                Ok(()) => {
                    info!("Device {} session ended cleanly", self.config.name);
                    backoff = Duration::from_secs(5);
                }
                Err(e) => {
                    error!(
                        "Device {} session error: {}. Reconnecting in {:?}",
                        self.config.name, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    async fn run_session(
        &mut self,
        state_tx: &mpsc::Sender<StateUpdate>,
        cmd_rx: &mut mpsc::Receiver<ClimateCommand>,
        poll_interval: Duration,
    ) -> Result<(), String> {
        let mut device =
            TuyaDevice::new("3.3", &self.config.id, Some(&self.config.key), self.config.ip)
                .map_err(|e| format!("Failed to create device: {e:?}"))?;

        let mut receiver = device
            .connect()
            .await
            .map_err(|e| format!("Failed to connect: {e:?}"))?;

        info!("Connected to device {}", self.config.name);

        self.publish_attributes(state_tx).await;

        // Initial DP query
        self.query_all_dps(&mut device).await?;

        let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(10));
        let mut poll_timer = tokio::time::interval(poll_interval);
        // Skip first tick (we already queried)
        poll_timer.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    device.heartbeat().await
                        .map_err(|e| format!("Heartbeat failed: {e:?}"))?;
                }
                _ = poll_timer.tick() => {
                    self.query_all_dps(&mut device).await?;
                }
                msg = receiver.recv() => {
                    match msg {
                        Some(Ok(messages)) => {
                            for m in messages {
                                if m.command == Some(CommandType::HeartBeat) {
                                    continue;
                                }
                                self.process_message(&m, state_tx).await;
                            }
                        }
                        Some(Err(e)) => {
                            return Err(format!("Device error: {e:?}"));
                        }
                        None => {
                            return Err("Device channel closed".into());
                        }
                    }
                }
                Some(cmd) = cmd_rx.recv() => {
                    self.handle_command(&mut device, cmd).await;
                }
            }
        }
    }

    /// Publish the static display attributes once per session so late MQTT
    /// subscribers still see them (retained by the MQTT task).
    async fn publish_attributes(&self, state_tx: &mpsc::Sender<StateUpdate>) {
        let climate = &self.config.climate;
        let attributes = [
            ("temperature_unit", climate.unit.as_str().to_string()),
            ("temperature_step", climate.temperature_step.to_string()),
        ];
        for (field, value) in attributes {
            self.send_update(state_tx, field, value).await;
        }
    }

    async fn query_all_dps(&self, device: &mut TuyaDevice) -> Result<(), String> {
        let payload = Payload::Struct(PayloadStruct {
            dev_id: self.config.id.clone(),
            gw_id: Some(self.config.id.clone()),
            uid: None,
            t: None,
            dp_id: None,
            dps: Some(json!({})),
        });

        device
            .get(payload)
            .await
            .map_err(|e| format!("DP query failed: {e:?}"))
    }

    async fn process_message(
        &mut self,
        msg: &rust_async_tuyapi::mesparse::Message,
        state_tx: &mpsc::Sender<StateUpdate>,
    ) {
        // Extract dps from whichever payload variant the library returns.
        // rust-async-tuyapi sometimes returns DP query responses as Payload::String
        // containing JSON like {"dps":{"1":true,"2":21,...}} instead of Payload::Struct.
        let dps_value: Option<serde_json::Value> = match &msg.payload {
            Payload::Struct(ps) => {
                debug!("PayloadStruct: dev_id={}, dps={:?}", ps.dev_id, ps.dps);
                ps.dps.clone()
            }
            Payload::String(s) => {
                debug!("Payload::String, attempting JSON parse");
                serde_json::from_str::<serde_json::Value>(s)
                    .ok()
                    .and_then(|v| v.get("dps").cloned())
            }
            Payload::Raw(b) => {
                debug!("Payload::Raw ({} bytes), skipping", b.len());
                None
            }
            _ => None,
        };

        let Some(dps) = dps_value else {
            debug!("No dps in message, skipping");
            return;
        };
        let Some(dps_map) = dps.as_object() else {
            debug!("dps is not a JSON object: {}", dps);
            return;
        };

        debug!("Merging {} DPs from device", dps_map.len());
        merge_dps(&mut self.snapshot, dps_map);

        // Re-decode on every update, however small: any DP may have changed.
        self.engine.status_updated(&self.snapshot);

        let fields = state_fields(self.engine.state(), &self.config.climate);
        for (field, value) in fields {
            self.send_update(state_tx, field, value).await;
        }
    }

    /// Plan the semantic command and issue its DP writes one by one. There
    /// is no atomicity across the writes: a transport failure mid-plan
    /// leaves the device partially written, and the true state is picked up
    /// again from the next snapshot.
    async fn handle_command(&self, device: &mut TuyaDevice, cmd: ClimateCommand) {
        let plan = match self.engine.plan(&cmd) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Rejected command for {}: {}", self.config.name, e);
                return;
            }
        };

        let total = plan.len();
        info!(
            "Sending command to {}: {:?} ({} writes)",
            self.config.name, cmd, total
        );

        for (completed, write) in plan.iter().enumerate() {
            if let Err(e) = self.write_dp(device, write).await {
                warn!(
                    "Command to {} failed after {} of {} writes: {}",
                    self.config.name, completed, total, e
                );
                return;
            }
        }
    }

    async fn write_dp(&self, device: &mut TuyaDevice, write: &DpWrite) -> Result<(), String> {
        let mut dps = serde_json::Map::new();
        dps.insert(write.dp_id.to_string(), write.value.clone());
        let dps = serde_json::Value::Object(dps);
        debug!("Writing DP to {}: {}", self.config.name, dps);
        device
            .set_values(dps)
            .await
            .map_err(|e| format!("{e:?}"))
    }

    async fn send_update(&self, state_tx: &mpsc::Sender<StateUpdate>, field: &str, value: String) {
        let update = StateUpdate {
            topic_name: self.config.topic_name.clone(),
            field: field.to_string(),
            value,
        };
        if state_tx.send(update).await.is_err() {
            warn!("State update channel closed");
        }
    }
}

/// Merge a dps JSON object into the snapshot. Tuya keys DPs as decimal
/// strings; anything non-numeric is skipped.
fn merge_dps(snapshot: &mut Snapshot, dps: &serde_json::Map<String, serde_json::Value>) {
    for (key, value) in dps {
        match key.parse::<u32>() {
            Ok(dp_id) => {
                snapshot.insert(dp_id, value.clone());
            }
            Err(_) => {
                debug!("Ignoring non-numeric DP key: {}", key);
            }
        }
    }
}

/// Flatten the decoded state into publishable (field, value) pairs.
/// Unresolved fields are omitted rather than published as empty.
fn state_fields(state: &ClimateState, climate: &ClimateConfig) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();

    if let Some(mode) = &state.hvac_mode {
        fields.push(("hvac_mode", mode.clone()));
    }
    if let Some(preset) = &state.preset {
        fields.push(("preset", preset.clone()));
    }
    if let Some(current) = state.current_temperature {
        fields.push((
            "current_temperature",
            format_temperature(current, climate.precision),
        ));
    }
    if let Some(target) = state.target_temperature {
        fields.push((
            "target_temperature",
            format_temperature(target, climate.target_precision),
        ));
    }
    // Always published: an empty value replaces the retained message once a
    // device leaves heat mode, instead of leaving a stale "heating" behind.
    fields.push((
        "hvac_action",
        state
            .hvac_action
            .map(|action| action.as_str().to_string())
            .unwrap_or_default(),
    ));
    if let Some(fan_mode) = &state.fan_mode {
        fields.push(("fan_mode", fan_mode.clone()));
    }
    fields.push(("min_temp", state.min_temp.to_string()));
    fields.push(("max_temp", state.max_temp.to_string()));

    fields
}

fn format_temperature(value: f64, precision: Precision) -> String {
    match precision {
        Precision::Whole => format!("{value:.0}"),
        Precision::Halves | Precision::Tenths => format!("{value:.1}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climate::HvacAction;

    #[test]
    fn merge_keeps_unrelated_dps_and_skips_bad_keys() {
        let mut snapshot = Snapshot::new();
        let first = serde_json::json!({"1": true, "3": 205});
        merge_dps(&mut snapshot, first.as_object().unwrap());
        let second = serde_json::json!({"3": 210, "devId": "x"});
        merge_dps(&mut snapshot, second.as_object().unwrap());

        assert_eq!(snapshot.get(&1), Some(&serde_json::json!(true)));
        assert_eq!(snapshot.get(&3), Some(&serde_json::json!(210)));
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn formats_temperature_by_precision() {
        assert_eq!(format_temperature(21.0, Precision::Whole), "21");
        assert_eq!(format_temperature(21.5, Precision::Halves), "21.5");
        // Tenths scaling can leave float noise; formatting clips it.
        assert_eq!(format_temperature(207.0 * 0.1, Precision::Tenths), "20.7");
    }

    #[test]
    fn unresolved_state_fields_are_omitted() {
        let climate = crate::config::ClimateConfig {
            target_temperature_dp: None,
            current_temperature_dp: None,
            fan_mode_dp: None,
            min_temp_dp: None,
            max_temp_dp: None,
            precision: Precision::Tenths,
            target_precision: Precision::Whole,
            temperature_step: 0.5,
            unit: crate::climate::scale::TemperatureUnit::Celsius,
            hvac_modes: crate::climate::table::ModeTable::default(),
            presets: crate::climate::table::ModeTable::default(),
        };
        let state = ClimateState {
            hvac_mode: Some("heat".to_string()),
            hvac_action: Some(HvacAction::Heating),
            min_temp: 7.0,
            max_temp: 35.0,
            ..ClimateState::default()
        };

        let fields = state_fields(&state, &climate);
        let names: Vec<_> = fields.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["hvac_mode", "hvac_action", "min_temp", "max_temp"]);
    }

    #[test]
    fn cleared_action_publishes_empty_value() {
        let climate = crate::config::ClimateConfig {
            target_temperature_dp: None,
            current_temperature_dp: None,
            fan_mode_dp: None,
            min_temp_dp: None,
            max_temp_dp: None,
            precision: Precision::Tenths,
            target_precision: Precision::Whole,
            temperature_step: 0.5,
            unit: crate::climate::scale::TemperatureUnit::Celsius,
            hvac_modes: crate::climate::table::ModeTable::default(),
            presets: crate::climate::table::ModeTable::default(),
        };
        let state = ClimateState {
            hvac_mode: Some("off".to_string()),
            hvac_action: None,
            min_temp: 7.0,
            max_temp: 35.0,
            ..ClimateState::default()
        };

        let fields = state_fields(&state, &climate);
        let action = fields
            .iter()
            .find(|(name, _)| *name == "hvac_action")
            .map(|(_, value)| value.as_str());
        assert_eq!(action, Some(""));
    }
}
