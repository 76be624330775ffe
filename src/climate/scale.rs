use serde::Deserialize;

/// Scale factor between a raw integer DP value and a physical temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Whole degrees (raw 21 → 21.0).
    Whole,
    /// Half degrees (raw 43 → 21.5).
    Halves,
    /// Tenths of a degree (raw 215 → 21.5).
    Tenths,
}

impl Precision {
    pub fn multiplier(self) -> f64 {
        match self {
            Precision::Whole => 1.0,
            Precision::Halves => 0.5,
            Precision::Tenths => 0.1,
        }
    }

    /// Map a config multiplier (1, 0.5, 0.1) back to a precision.
    pub fn from_multiplier(value: f64) -> Option<Self> {
        if value == 1.0 {
            Some(Precision::Whole)
        } else if value == 0.5 {
            Some(Precision::Halves)
        } else if value == 0.1 {
            Some(Precision::Tenths)
        } else {
            None
        }
    }

    pub fn raw_to_physical(self, raw: i64) -> f64 {
        raw as f64 * self.multiplier()
    }

    pub fn physical_to_raw(self, physical: f64) -> i64 {
        (physical / self.multiplier()).round() as i64
    }
}

/// Display unit for temperatures. Labels only; raw scaling is unit-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
        }
    }
}
