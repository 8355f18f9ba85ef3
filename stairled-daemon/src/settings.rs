use std::collections::HashMap;
use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use stairled_driver::mapper::PinAssignment;
use stairled_engine::registry::NamedAnimationSpec;
use stairled_engine::sensor::Sensor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logger {
    pub level: String,
}

/// MQTT broker connection and the sensor topic to watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    /// Stripped from inbound sensor names before dispatch.
    #[serde(default = "default_sensor_prefix")]
    pub sensor_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardware {
    pub bus_path: String,
    #[serde(default = "default_oscillator_hz")]
    pub oscillator_hz: u32,
    /// Run the visible ramp over every mapped step at startup.
    #[serde(default)]
    pub self_test: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinMapperSettings {
    /// Empty means the sequential default over discovered chips.
    #[serde(default)]
    pub mapping: Vec<PinAssignment>,
    #[serde(default = "default_pwm_hz")]
    pub pwm_hz: u32,
}

impl Default for PinMapperSettings {
    fn default() -> Self {
        Self {
            mapping: Vec::new(),
            pwm_hz: default_pwm_hz(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
        }
    }
}

fn default_sensor_prefix() -> String {
    "stairled-sensor-".to_string()
}

fn default_oscillator_hz() -> u32 {
    27_000_000
}

fn default_pwm_hz() -> u32 {
    52_000
}

fn default_tick_hz() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub logger: Logger,
    pub gateway: Gateway,
    pub hardware: Hardware,
    #[serde(default)]
    pub pinmapper: PinMapperSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
    #[serde(default)]
    pub animations: HashMap<String, NamedAnimationSpec>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or("development".into());

        Config::builder()
            .add_source(File::with_name("configs/default"))
            .add_source(File::with_name(&format!("configs/{run_mode}")).required(false))
            .add_source(Environment::default().separator("_"))
            .build()?
            .try_deserialize()
    }
}
