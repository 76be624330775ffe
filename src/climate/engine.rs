use serde_json::json;
use tracing::debug;

use crate::config::ClimateConfig;

use super::{ClimateCommand, ClimateError, ClimateState, DpWrite, HvacAction, Snapshot};

/// Mode name that drives heating-action inference.
pub const HVAC_MODE_HEAT: &str = "heat";

/// Fallback temperature bounds when no min/max DP is configured.
pub const DEFAULT_MIN_TEMP: f64 = 7.0;
pub const DEFAULT_MAX_TEMP: f64 = 35.0;

/// Per-device mapping engine: DP snapshot in, semantic climate state out,
/// semantic command in, ordered DP writes out.
///
/// Holds exactly one piece of carried state beyond the decoded fields: the
/// last inferred HVAC action, used to keep a reading sitting on the
/// hysteresis band boundary from oscillating. One engine per device; the
/// owning device task is the only writer.
pub struct ClimateEngine {
    config: ClimateConfig,
    state: ClimateState,
}

impl ClimateEngine {
    pub fn new(config: ClimateConfig) -> Self {
        let state = ClimateState {
            min_temp: DEFAULT_MIN_TEMP,
            max_temp: DEFAULT_MAX_TEMP,
            ..ClimateState::default()
        };
        Self { config, state }
    }

    pub fn config(&self) -> &ClimateConfig {
        &self.config
    }

    pub fn state(&self) -> &ClimateState {
        &self.state
    }

    /// Recompute the semantic state from the latest full snapshot.
    ///
    /// Runs on every device status update, however small: any DP may have
    /// changed. Fields that don't resolve from this snapshot keep their
    /// previous value.
    pub fn status_updated(&mut self, snapshot: &Snapshot) -> &ClimateState {
        if let Some(dp_id) = self.config.current_temperature_dp {
            if let Some(raw) = raw_int(snapshot, dp_id) {
                self.state.current_temperature =
                    Some(self.config.precision.raw_to_physical(raw));
            }
        }

        if let Some(dp_id) = self.config.target_temperature_dp {
            if let Some(raw) = raw_int(snapshot, dp_id) {
                self.state.target_temperature =
                    Some(self.config.target_precision.raw_to_physical(raw));
            }
        }

        // Min/max DPs report bounds directly in degrees, unscaled.
        if let Some(dp_id) = self.config.min_temp_dp {
            if let Some(value) = snapshot.get(&dp_id).and_then(|v| v.as_f64()) {
                self.state.min_temp = value;
            }
        }
        if let Some(dp_id) = self.config.max_temp_dp {
            if let Some(value) = snapshot.get(&dp_id).and_then(|v| v.as_f64()) {
                self.state.max_temp = value;
            }
        }

        if let Some(name) = self.config.hvac_modes.resolve(snapshot) {
            self.state.hvac_mode = Some(name.to_string());
        }
        if let Some(name) = self.config.presets.resolve(snapshot) {
            self.state.preset = Some(name.to_string());
        }

        if let Some(dp_id) = self.config.fan_mode_dp {
            if let Some(value) = snapshot.get(&dp_id) {
                self.state.fan_mode = Some(display_value(value));
            }
        }

        if self.state.hvac_mode.as_deref() == Some(HVAC_MODE_HEAT) {
            self.infer_action();
        } else {
            // Action is only meaningful while heating is in charge.
            self.state.hvac_action = None;
        }

        debug!(state = ?self.state, "decoded climate state");
        &self.state
    }

    /// Hysteresis over a band of one precision unit either side of target:
    /// heating engages once the deficit exceeds one unit, idles once the
    /// reading recovers to within one unit. Exactly on the lower boundary
    /// the previous action is held.
    fn infer_action(&mut self) {
        let (Some(current), Some(target)) =
            (self.state.current_temperature, self.state.target_temperature)
        else {
            return;
        };

        let lower_bound = target - self.config.precision.multiplier();
        if current < lower_bound {
            self.state.hvac_action = Some(HvacAction::Heating);
        } else if current > lower_bound {
            self.state.hvac_action = Some(HvacAction::Idle);
        }
        // current == lower_bound: hold the previous action.
    }

    /// Translate a semantic command into the ordered DP writes that realize
    /// it. No writes are produced on error.
    pub fn plan(&self, command: &ClimateCommand) -> Result<Vec<DpWrite>, ClimateError> {
        match command {
            ClimateCommand::SetHvacMode(name) => self
                .config
                .hvac_modes
                .plan(name)
                .ok_or_else(|| ClimateError::UnknownMode(name.clone())),
            ClimateCommand::SetPreset(name) => {
                if self.config.presets.is_empty() {
                    return Err(ClimateError::Unsupported("preset"));
                }
                self.config
                    .presets
                    .plan(name)
                    .ok_or_else(|| ClimateError::UnknownPreset(name.clone()))
            }
            ClimateCommand::SetTargetTemperature(physical) => {
                let dp_id = self
                    .config
                    .target_temperature_dp
                    .ok_or(ClimateError::Unsupported("target temperature"))?;
                let raw = self.config.target_precision.physical_to_raw(*physical);
                Ok(vec![DpWrite {
                    dp_id,
                    value: json!(raw),
                }])
            }
            ClimateCommand::SetFanMode(mode) => {
                let dp_id = self
                    .config
                    .fan_mode_dp
                    .ok_or(ClimateError::Unsupported("fan mode"))?;
                Ok(vec![DpWrite {
                    dp_id,
                    value: json!(mode),
                }])
            }
        }
    }
}

fn raw_int(snapshot: &Snapshot, dp_id: u32) -> Option<i64> {
    snapshot.get(&dp_id)?.as_i64()
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climate::scale::{Precision, TemperatureUnit};
    use crate::climate::table::{ModeRule, ModeTable};

    fn test_config() -> ClimateConfig {
        ClimateConfig {
            target_temperature_dp: Some(2),
            current_temperature_dp: Some(3),
            fan_mode_dp: None,
            min_temp_dp: None,
            max_temp_dp: None,
            precision: Precision::Whole,
            target_precision: Precision::Whole,
            temperature_step: 0.5,
            unit: TemperatureUnit::Celsius,
            hvac_modes: ModeTable::new(vec![
                ModeRule::new("off", vec![(1, serde_json::json!(false))]),
                ModeRule::new(
                    "heat",
                    vec![(1, serde_json::json!(true)), (4, serde_json::json!("1"))],
                ),
                ModeRule::new(
                    "auto",
                    vec![(1, serde_json::json!(true)), (4, serde_json::json!("0"))],
                ),
            ]),
            presets: ModeTable::new(vec![
                ModeRule::new("eco-on", vec![(5, serde_json::json!(true))]),
                ModeRule::new("eco-off", vec![(5, serde_json::json!(false))]),
            ]),
        }
    }

    fn snapshot(entries: &[(u32, serde_json::Value)]) -> Snapshot {
        entries.iter().cloned().collect()
    }

    #[test]
    fn decodes_mode_and_preset_from_snapshot() {
        let mut engine = ClimateEngine::new(test_config());
        let state = engine.status_updated(&snapshot(&[
            (1, serde_json::json!(true)),
            (4, serde_json::json!("1")),
            (5, serde_json::json!(true)),
        ]));
        assert_eq!(state.hvac_mode.as_deref(), Some("heat"));
        assert_eq!(state.preset.as_deref(), Some("eco-on"));
    }

    #[test]
    fn no_match_retains_previous_values() {
        let mut engine = ClimateEngine::new(test_config());
        engine.status_updated(&snapshot(&[(1, serde_json::json!(false))]));
        assert_eq!(engine.state().hvac_mode.as_deref(), Some("off"));

        // DP 4 alone satisfies no mode rule; mode must not reset.
        engine.status_updated(&snapshot(&[(4, serde_json::json!("1"))]));
        assert_eq!(engine.state().hvac_mode.as_deref(), Some("off"));
    }

    #[test]
    fn scales_temperatures_with_independent_precisions() {
        let mut config = test_config();
        config.precision = Precision::Tenths;
        config.target_precision = Precision::Whole;
        let mut engine = ClimateEngine::new(config);

        let state = engine.status_updated(&snapshot(&[
            (2, serde_json::json!(21)),
            (3, serde_json::json!(205)),
        ]));
        assert_eq!(state.target_temperature, Some(21.0));
        assert_eq!(state.current_temperature, Some(20.5));
    }

    #[test]
    fn hysteresis_boundary() {
        let mut engine = ClimateEngine::new(test_config());
        let heat_dps = [(1, serde_json::json!(true)), (4, serde_json::json!("1"))];

        // Deficit beyond one unit: heating.
        let mut dps = heat_dps.to_vec();
        dps.extend([(2, serde_json::json!(20)), (3, serde_json::json!(18))]);
        engine.status_updated(&snapshot(&dps));
        assert_eq!(engine.state().hvac_action, Some(HvacAction::Heating));

        // Exactly on the band boundary: previous action held.
        let mut dps = heat_dps.to_vec();
        dps.extend([(2, serde_json::json!(20)), (3, serde_json::json!(19))]);
        engine.status_updated(&snapshot(&dps));
        assert_eq!(engine.state().hvac_action, Some(HvacAction::Heating));

        // Recovered past target: idle.
        let mut dps = heat_dps.to_vec();
        dps.extend([(2, serde_json::json!(20)), (3, serde_json::json!(21))]);
        engine.status_updated(&snapshot(&dps));
        assert_eq!(engine.state().hvac_action, Some(HvacAction::Idle));

        // Back on the boundary: idle is held this time.
        let mut dps = heat_dps.to_vec();
        dps.extend([(2, serde_json::json!(20)), (3, serde_json::json!(19))]);
        engine.status_updated(&snapshot(&dps));
        assert_eq!(engine.state().hvac_action, Some(HvacAction::Idle));
    }

    #[test]
    fn action_not_inferred_outside_heat_mode() {
        let mut engine = ClimateEngine::new(test_config());
        engine.status_updated(&snapshot(&[
            (1, serde_json::json!(false)),
            (2, serde_json::json!(20)),
            (3, serde_json::json!(15)),
        ]));
        assert_eq!(engine.state().hvac_action, None);
    }

    #[test]
    fn action_cleared_after_leaving_heat_mode() {
        let mut engine = ClimateEngine::new(test_config());
        engine.status_updated(&snapshot(&[
            (1, serde_json::json!(true)),
            (4, serde_json::json!("1")),
            (2, serde_json::json!(20)),
            (3, serde_json::json!(18)),
        ]));
        assert_eq!(engine.state().hvac_action, Some(HvacAction::Heating));

        // Switching off must not leave the heating action behind.
        engine.status_updated(&snapshot(&[(1, serde_json::json!(false))]));
        assert_eq!(engine.state().hvac_mode.as_deref(), Some("off"));
        assert_eq!(engine.state().hvac_action, None);
    }

    #[test]
    fn ambiguity_resolves_to_last_matching_rule() {
        let mut engine = ClimateEngine::new(test_config());
        let state = engine.status_updated(&snapshot(&[
            (1, serde_json::json!(true)),
            (4, serde_json::json!("1")),
            (5, serde_json::json!(true)),
        ]));
        assert_eq!(state.hvac_mode.as_deref(), Some("heat"));
        assert_eq!(state.preset.as_deref(), Some("eco-on"));
    }

    #[test]
    fn plan_mode_emits_writes_in_declared_order() {
        let engine = ClimateEngine::new(test_config());
        let plan = engine
            .plan(&ClimateCommand::SetHvacMode("heat".to_string()))
            .unwrap();
        assert_eq!(
            plan,
            vec![
                DpWrite {
                    dp_id: 1,
                    value: serde_json::json!(true)
                },
                DpWrite {
                    dp_id: 4,
                    value: serde_json::json!("1")
                },
            ]
        );
    }

    #[test]
    fn plan_unknown_mode_fails_without_writes() {
        let engine = ClimateEngine::new(test_config());
        let err = engine
            .plan(&ClimateCommand::SetHvacMode("cool".to_string()))
            .unwrap_err();
        assert_eq!(err, ClimateError::UnknownMode("cool".to_string()));
    }

    #[test]
    fn plan_target_temperature_scales_to_raw() {
        let mut config = test_config();
        config.target_precision = Precision::Halves;
        let engine = ClimateEngine::new(config);
        let plan = engine
            .plan(&ClimateCommand::SetTargetTemperature(21.5))
            .unwrap();
        assert_eq!(
            plan,
            vec![DpWrite {
                dp_id: 2,
                value: serde_json::json!(43)
            }]
        );
    }

    #[test]
    fn plan_without_configured_dp_is_unsupported() {
        let mut config = test_config();
        config.target_temperature_dp = None;
        let engine = ClimateEngine::new(config);
        let err = engine
            .plan(&ClimateCommand::SetTargetTemperature(20.0))
            .unwrap_err();
        assert_eq!(err, ClimateError::Unsupported("target temperature"));
    }

    #[test]
    fn default_bounds_without_min_max_dps() {
        let engine = ClimateEngine::new(test_config());
        assert_eq!(engine.state().min_temp, DEFAULT_MIN_TEMP);
        assert_eq!(engine.state().max_temp, DEFAULT_MAX_TEMP);
    }

    #[test]
    fn bounds_read_unscaled_from_dps() {
        let mut config = test_config();
        config.min_temp_dp = Some(10);
        config.max_temp_dp = Some(11);
        let mut engine = ClimateEngine::new(config);
        engine.status_updated(&snapshot(&[
            (10, serde_json::json!(5)),
            (11, serde_json::json!(30)),
        ]));
        assert_eq!(engine.state().min_temp, 5.0);
        assert_eq!(engine.state().max_temp, 30.0);
    }
}
