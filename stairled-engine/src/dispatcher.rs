use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use stairled_driver::throttle::Throttle;

use crate::clock::Clock;
use crate::engine::EngineControl;
use crate::error::EngineError;
use crate::registry::AnimationRegistry;
use crate::sensor::{Sensor, SensorSample};
use crate::trigger::{TriggerEvent, TriggerSink};

/// A triggered sensor stays latched at least this long, independent of how
/// short its animation is.
const MIN_ACTIVE_MS: u64 = 2_000;

/// While a sensor is latched, repeated triggers log at most this often.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct SensorRuntime {
    /// Latched after a successful trigger until the hold timer clears it.
    active: bool,
    /// Set when the engine answered `Busy`; the next sample clears `active`
    /// so this sensor yields to the running animation.
    pending_reset: bool,
    last_trigger_at: Option<u64>,
    /// Missing registry entries log once per sensor.
    missing_logged: bool,
}

struct SensorEntry {
    config: Sensor,
    runtime: Mutex<SensorRuntime>,
    drop_log: Throttle,
}

impl SensorEntry {
    fn new(config: Sensor) -> Self {
        Self {
            config,
            runtime: Mutex::new(SensorRuntime::default()),
            drop_log: Throttle::new(DROP_LOG_INTERVAL),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SensorRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type SensorTable = HashMap<String, Arc<SensorEntry>>;

/// Turns the inbound sample stream into single-flight animation starts.
///
/// The sensor table is replaced copy-on-write; a handler that is mid-sample
/// finishes against the snapshot it looked up.
pub struct SensorDispatcher<E: EngineControl> {
    engine: Arc<E>,
    registry: Arc<AnimationRegistry>,
    sink: Arc<dyn TriggerSink>,
    clock: Arc<dyn Clock>,
    table: RwLock<Arc<SensorTable>>,
    name_prefix: String,
}

impl<E: EngineControl + 'static> SensorDispatcher<E> {
    pub fn new(
        engine: Arc<E>,
        registry: Arc<AnimationRegistry>,
        sink: Arc<dyn TriggerSink>,
        clock: Arc<dyn Clock>,
        sensors: Vec<Sensor>,
        name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            sink,
            clock,
            table: RwLock::new(Arc::new(build_table(sensors))),
            name_prefix: name_prefix.into(),
        }
    }

    /// Atomic table swap from a configuration reload. Runtime latches start
    /// fresh; in-flight samples finish against the old snapshot.
    pub fn replace_sensors(&self, sensors: Vec<Sensor>) {
        let table = Arc::new(build_table(sensors));
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = table;
    }

    pub fn sensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    /// Consumes the sample stream until every sender is gone. Overflow on
    /// the bounded channel drops the oldest samples.
    pub async fn run(self: Arc<Self>, mut samples: broadcast::Receiver<SensorSample>) {
        loop {
            match samples.recv().await {
                Ok(sample) => self.handle_sample(sample).await,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("sensor queue overflow, dropped {count} oldest samples");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn handle_sample(&self, sample: SensorSample) {
        let name = sample
            .name
            .strip_prefix(&self.name_prefix)
            .unwrap_or(&sample.name);
        let Some(entry) = self.snapshot().get(name).cloned() else {
            debug!("sample for unknown sensor {name:?}");
            return;
        };
        if !entry.config.enabled {
            return;
        }

        {
            let mut runtime = entry.lock();
            if runtime.pending_reset {
                runtime.active = false;
                runtime.pending_reset = false;
            }
            if !entry
                .config
                .operator
                .matches(sample.value, entry.config.threshold)
            {
                return;
            }
            if runtime.active {
                if entry.drop_log.allow() {
                    debug!(
                        "sensor {:?} already active, dropping sample",
                        entry.config.name
                    );
                }
                return;
            }
        }

        self.trigger(&entry, &sample).await;
    }

    async fn trigger(&self, entry: &Arc<SensorEntry>, sample: &SensorSample) {
        let Some(named) = self.registry.get(&entry.config.animation) else {
            let mut runtime = entry.lock();
            if !runtime.missing_logged {
                runtime.missing_logged = true;
                warn!(
                    "sensor {:?} references unknown animation {:?}",
                    entry.config.name, entry.config.animation
                );
            }
            return;
        };

        match self.engine.start(&entry.config.animation).await {
            Ok(()) => {
                let now = self.clock.now_ms();
                {
                    let mut runtime = entry.lock();
                    runtime.active = true;
                    runtime.pending_reset = false;
                    runtime.last_trigger_at = Some(now);
                }
                let event = TriggerEvent {
                    sensor_name: entry.config.name.clone(),
                    value: sample.value,
                    animation_name: entry.config.animation.clone(),
                    timestamp_ms: now,
                };
                if let Err(err) = self.sink.record(event).await {
                    warn!("failed to record trigger event: {err}");
                }
                // clear the latch after the run plus a safety margin
                let hold_ms = MIN_ACTIVE_MS.max(named.duration_ms());
                let entry = Arc::clone(entry);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    let mut runtime = entry.lock();
                    runtime.active = false;
                    runtime.pending_reset = false;
                });
            }
            Err(EngineError::Busy) => {
                // another sensor's animation is running; yield quietly
                debug!("engine busy, sensor {:?} yields", entry.config.name);
                let mut runtime = entry.lock();
                runtime.active = true;
                runtime.pending_reset = true;
            }
            Err(err) => {
                warn!(
                    "failed to start {:?} for sensor {:?}: {err}",
                    entry.config.animation, entry.config.name
                );
            }
        }
    }

    fn snapshot(&self) -> Arc<SensorTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn build_table(sensors: Vec<Sensor>) -> SensorTable {
    let mut table = SensorTable::new();
    for sensor in sensors {
        if let Err(err) = sensor.validate() {
            warn!("rejecting sensor {:?}: {err}", sensor.name);
            continue;
        }
        table.insert(sensor.name.clone(), Arc::new(SensorEntry::new(sensor)));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{AnimationSpec, TimelineItemSpec};
    use crate::clock::ManualClock;
    use crate::easing::Easing;
    use crate::registry::NamedAnimationSpec;
    use crate::sensor::TriggerOperator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingEngine {
        busy: AtomicBool,
        starts: Mutex<Vec<String>>,
    }

    impl RecordingEngine {
        fn new() -> Self {
            Self {
                busy: AtomicBool::new(false),
                starts: Mutex::new(Vec::new()),
            }
        }

        fn starts(&self) -> Vec<String> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EngineControl for RecordingEngine {
        async fn start(&self, name: &str) -> Result<(), EngineError> {
            if self.busy.load(Ordering::SeqCst) {
                return Err(EngineError::Busy);
            }
            self.starts.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn stop(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<TriggerEvent>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<TriggerEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TriggerSink for RecordingSink {
        async fn record(
            &self,
            event: TriggerEvent,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn registry_with(names: &[&str]) -> Arc<AnimationRegistry> {
        let registry = AnimationRegistry::new();
        registry.load_from(names.iter().map(|&name| {
            (
                name.to_string(),
                NamedAnimationSpec {
                    description: String::new(),
                    timeline: vec![TimelineItemSpec {
                        offset_ms: 0,
                        animation: AnimationSpec::FadeIn {
                            leds: vec![1],
                            start_brightness: 0,
                            end_brightness: 4000,
                            duration_ms: 1000,
                            easing: Easing::Linear,
                        },
                    }],
                    step_groups: None,
                },
            )
        }));
        Arc::new(registry)
    }

    fn sensor(name: &str, animation: &str) -> Sensor {
        Sensor {
            name: name.into(),
            channel_id: 1,
            threshold: 500,
            operator: TriggerOperator::Lte,
            animation: animation.into(),
            enabled: true,
        }
    }

    fn sample(name: &str, value: i32, timestamp_ms: u64) -> SensorSample {
        SensorSample {
            name: name.into(),
            value,
            timestamp_ms,
        }
    }

    struct Fixture {
        dispatcher: Arc<SensorDispatcher<RecordingEngine>>,
        engine: Arc<RecordingEngine>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(sensors: Vec<Sensor>, animations: &[&str]) -> Fixture {
        let engine = Arc::new(RecordingEngine::new());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Arc::new(SensorDispatcher::new(
            engine.clone(),
            registry_with(animations),
            sink.clone(),
            Arc::new(ManualClock::at(0)),
            sensors,
            "stairled-sensor-",
        ));
        Fixture {
            dispatcher,
            engine,
            sink,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_triggers_animation_once() {
        // samples 600, 400, 300 against threshold <= 500: one start, one event
        let f = fixture(vec![sensor("a", "fade1")], &["fade1"]);

        f.dispatcher.handle_sample(sample("a", 600, 0)).await;
        f.dispatcher.handle_sample(sample("a", 400, 10)).await;
        f.dispatcher.handle_sample(sample("a", 300, 20)).await;

        assert_eq!(f.engine.starts(), vec!["fade1"]);
        let events = f.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sensor_name, "a");
        assert_eq!(events[0].value, 400);
        assert_eq!(events[0].animation_name, "fade1");
    }

    #[tokio::test(start_paused = true)]
    async fn latch_clears_after_hold_and_margin() {
        let f = fixture(vec![sensor("a", "fade1")], &["fade1"]);

        f.dispatcher.handle_sample(sample("a", 100, 0)).await;
        assert_eq!(f.engine.starts().len(), 1);

        // animation is 1000 ms, so the 2 s margin governs
        tokio::time::sleep(Duration::from_millis(2100)).await;
        f.dispatcher.handle_sample(sample("a", 100, 0)).await;
        assert_eq!(f.engine.starts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_engine_drops_trigger_without_event() {
        let f = fixture(
            vec![sensor("a", "fade1"), sensor("b", "fade2")],
            &["fade1", "fade2"],
        );

        f.dispatcher.handle_sample(sample("a", 100, 0)).await;
        f.engine.busy.store(true, Ordering::SeqCst);
        f.dispatcher.handle_sample(sample("b", 100, 0)).await;

        assert_eq!(f.engine.starts(), vec!["fade1"]);
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn yielded_sensor_rearms_on_the_next_sample() {
        let f = fixture(vec![sensor("b", "fade2")], &["fade2"]);

        f.engine.busy.store(true, Ordering::SeqCst);
        f.dispatcher.handle_sample(sample("b", 100, 0)).await;
        assert!(f.engine.starts().is_empty());

        // the other animation finished; the next matching sample triggers
        f.engine.busy.store(false, Ordering::SeqCst);
        f.dispatcher.handle_sample(sample("b", 100, 0)).await;
        assert_eq!(f.engine.starts(), vec!["fade2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_sensors_are_ignored() {
        let mut disabled = sensor("a", "fade1");
        disabled.enabled = false;
        let f = fixture(vec![disabled], &["fade1"]);

        f.dispatcher.handle_sample(sample("a", 100, 0)).await;
        assert!(f.engine.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_prefix_is_stripped() {
        let f = fixture(vec![sensor("hall", "fade1")], &["fade1"]);

        f.dispatcher
            .handle_sample(sample("stairled-sensor-hall", 100, 0))
            .await;
        assert_eq!(f.engine.starts(), vec!["fade1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_animation_makes_sensor_inert() {
        let f = fixture(vec![sensor("a", "ghost")], &[]);

        f.dispatcher.handle_sample(sample("a", 100, 0)).await;
        f.dispatcher.handle_sample(sample("a", 100, 0)).await;
        assert!(f.engine.starts().is_empty());
        assert!(f.sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_swaps_the_sensor_table() {
        let f = fixture(vec![sensor("a", "fade1")], &["fade1", "fade2"]);

        f.dispatcher.replace_sensors(vec![sensor("c", "fade2")]);
        assert_eq!(f.dispatcher.sensor_names(), vec!["c"]);

        f.dispatcher.handle_sample(sample("a", 100, 0)).await;
        f.dispatcher.handle_sample(sample("c", 100, 0)).await;
        assert_eq!(f.engine.starts(), vec!["fade2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_sensor_entries_are_rejected_individually() {
        let mut broken = sensor("", "fade1");
        broken.name = String::new();
        let f = fixture(vec![broken, sensor("ok", "fade1")], &["fade1"]);
        assert_eq!(f.dispatcher.sensor_names(), vec!["ok"]);
    }
}
