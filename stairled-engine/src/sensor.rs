use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Threshold comparison a sensor applies to incoming values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOperator {
    #[serde(alias = "<=")]
    Lte,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "==")]
    Eq,
}

impl TriggerOperator {
    pub fn matches(self, value: i32, threshold: i32) -> bool {
        match self {
            TriggerOperator::Lte => value <= threshold,
            TriggerOperator::Gte => value >= threshold,
            TriggerOperator::Eq => value == threshold,
        }
    }
}

/// A configured motion/presence sensor and the animation it triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub name: String,
    pub channel_id: u32,
    pub threshold: i32,
    pub operator: TriggerOperator,
    /// Registry name of the animation to start.
    #[serde(alias = "target_animation")]
    pub animation: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Sensor {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }
        if self.animation.is_empty() {
            return Err(ConfigError::invalid("animation", "must not be empty"));
        }
        Ok(())
    }
}

/// One reading as it crosses into the core, transport already stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    #[serde(alias = "sensor", alias = "sensor_name")]
    pub name: String,
    pub value: i32,
    #[serde(default, alias = "ts")]
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_compare_against_threshold() {
        assert!(TriggerOperator::Lte.matches(400, 500));
        assert!(TriggerOperator::Lte.matches(500, 500));
        assert!(!TriggerOperator::Lte.matches(600, 500));
        assert!(TriggerOperator::Gte.matches(600, 500));
        assert!(!TriggerOperator::Gte.matches(400, 500));
        assert!(TriggerOperator::Eq.matches(500, 500));
        assert!(!TriggerOperator::Eq.matches(501, 500));
    }

    #[test]
    fn operator_accepts_symbol_aliases() {
        let op: TriggerOperator = serde_json::from_str("\"<=\"").unwrap();
        assert_eq!(op, TriggerOperator::Lte);
        let op: TriggerOperator = serde_json::from_str("\"gte\"").unwrap();
        assert_eq!(op, TriggerOperator::Gte);
    }

    #[test]
    fn sample_tolerates_wire_aliases() {
        let sample: SensorSample =
            serde_json::from_str(r#"{"sensor": "stairled-sensor-a", "value": 42, "ts": 7}"#)
                .unwrap();
        assert_eq!(sample.name, "stairled-sensor-a");
        assert_eq!(sample.value, 42);
        assert_eq!(sample.timestamp_ms, 7);
    }

    #[test]
    fn sensor_defaults_to_enabled() {
        let sensor: Sensor = serde_json::from_str(
            r#"{
                "name": "a",
                "channel_id": 1,
                "threshold": 500,
                "operator": "lte",
                "animation": "fade1"
            }"#,
        )
        .unwrap();
        assert!(sensor.enabled);
        sensor.validate().unwrap();
    }

    #[test]
    fn sensor_without_target_is_rejected() {
        let sensor = Sensor {
            name: "a".into(),
            channel_id: 1,
            threshold: 500,
            operator: TriggerOperator::Lte,
            animation: String::new(),
            enabled: true,
        };
        assert!(sensor.validate().is_err());
    }
}
