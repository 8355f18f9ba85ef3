use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use stairled_driver::bus::{LinuxBus, SharedBus};
use stairled_driver::mapper::{PinAssignment, PinMapper};
use stairled_engine::clock::MonotonicClock;
use stairled_engine::dispatcher::SensorDispatcher;
use stairled_engine::engine::{Engine, EngineConfig, EngineControl, EngineHandle};
use stairled_engine::registry::{AnimationRegistry, LoadReport, NamedAnimationSpec};
use stairled_engine::sensor::{Sensor, SensorSample};
use stairled_engine::trigger::TriggerEvent;

use crate::mqtt_client::start_mqtt_client;
use crate::settings::Settings;
use crate::sink::TriggerPublisher;

/// Bounded sensor sample queue; overflow drops the oldest samples.
const SAMPLE_QUEUE: usize = 64;

/// Everything wired: hardware, registry, engine thread, dispatcher task and
/// MQTT ingress. External surfaces (UI, recorders) reach the core through
/// this struct only.
pub struct App {
    pub mapper: Arc<PinMapper>,
    pub registry: Arc<AnimationRegistry>,
    pub engine: EngineHandle,
    dispatcher: Arc<SensorDispatcher<EngineHandle>>,
    triggers: Arc<TriggerPublisher>,
    samples: broadcast::Sender<SensorSample>,
}

/// Startup discovery artefact, pullable read-only by an external UI.
#[derive(Debug, Serialize)]
pub struct DiscoverySnapshot {
    pub chips: Vec<String>,
    pub mapping: Vec<PinAssignment>,
}

pub async fn create_app(settings: &Arc<Settings>) -> anyhow::Result<App> {
    let bus: SharedBus = Arc::new(Mutex::new(LinuxBus::open(&settings.hardware.bus_path)));

    let discovered = {
        let bus = bus.clone();
        tokio::task::spawn_blocking(move || PinMapper::discover(&bus)).await?
    };
    info!(
        "discovered chips: [{}]",
        discovered
            .iter()
            .map(|chip| format!("0x{chip:02x}"))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mapper = {
        let bus = bus.clone();
        let mapping = settings.pinmapper.mapping.clone();
        let pwm_hz = settings.pinmapper.pwm_hz;
        let oscillator_hz = settings.hardware.oscillator_hz;
        tokio::task::spawn_blocking(move || {
            PinMapper::initialize(bus, &discovered, &mapping, pwm_hz, oscillator_hz)
        })
        .await?
        .context("pin mapper bring-up failed")?
    };
    let mapper = Arc::new(mapper);

    if settings.hardware.self_test {
        let mapper = mapper.clone();
        tokio::task::spawn_blocking(move || mapper.test()).await?;
    }

    let registry = Arc::new(AnimationRegistry::new());
    let report = registry.load_from(settings.animations.clone());
    for (name, err) in &report.rejected {
        warn!("animation {name:?} rejected: {err}");
    }
    info!("animation registry loaded: {} entries", report.loaded.len());

    let clock = Arc::new(MonotonicClock::new());
    let engine = Engine::spawn(
        registry.clone(),
        mapper.clone(),
        clock.clone(),
        EngineConfig {
            tick_hz: settings.engine.tick_hz,
        },
    )
    .context("failed to spawn the engine thread")?;

    let triggers = Arc::new(TriggerPublisher::new(SAMPLE_QUEUE));
    let dispatcher = Arc::new(SensorDispatcher::new(
        Arc::new(engine.clone()),
        registry.clone(),
        triggers.clone(),
        clock,
        settings.sensors.clone(),
        settings.gateway.sensor_prefix.clone(),
    ));

    let (samples, receiver) = broadcast::channel(SAMPLE_QUEUE);
    tokio::spawn(dispatcher.clone().run(receiver));

    start_mqtt_client(settings.gateway.clone(), samples.clone())
        .await
        .map_err(|err| anyhow::anyhow!("MQTT startup failed: {err}"))?;

    Ok(App {
        mapper,
        registry,
        engine,
        dispatcher,
        triggers,
        samples,
    })
}

impl App {
    pub fn discovery_snapshot(&self) -> DiscoverySnapshot {
        DiscoverySnapshot {
            chips: self
                .mapper
                .chips()
                .into_iter()
                .map(|chip| format!("0x{chip:02x}"))
                .collect(),
            mapping: self.mapper.mapping(),
        }
    }

    /// Atomic registry reload for an external control surface.
    pub fn reload_animations(&self, animations: HashMap<String, NamedAnimationSpec>) -> LoadReport {
        self.registry.load_from(animations)
    }

    /// Atomic sensor table reload.
    pub fn replace_sensors(&self, sensors: Vec<Sensor>) {
        self.dispatcher.replace_sensors(sensors);
    }

    /// Live trigger event feed.
    pub fn trigger_events(&self) -> broadcast::Receiver<TriggerEvent> {
        self.triggers.subscribe()
    }

    /// Local sample injection, bypassing MQTT (self-tests, UI "try it").
    pub fn sample_sender(&self) -> broadcast::Sender<SensorSample> {
        self.samples.clone()
    }

    /// Stops the engine and darkens the stairs. Safe to call more than
    /// once; the mapper's shutdown is first-caller-wins.
    pub async fn shutdown(&self) {
        if let Err(err) = self.engine.stop().await {
            warn!("engine stop failed during shutdown: {err}");
        }
        let mapper = self.mapper.clone();
        if tokio::task::spawn_blocking(move || mapper.shutdown())
            .await
            .is_err()
        {
            warn!("shutdown task failed");
        }
    }
}
