use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::SharedBus;
use crate::error::Error;
use crate::pca9685::{Pca9685, CHANNELS, MODE1};
use crate::{Brightness, Step, MAX_BRIGHTNESS};

/// PCA9685 address window.
pub const ADDRESS_RANGE: RangeInclusive<u8> = 0x40..=0x7F;

/// Reads back on the Pi without a device attached.
const GHOST_ADDRESS: u8 = 0x70;

/// Brightness used by the startup self-test ramp.
const TEST_BRIGHTNESS: Brightness = 2000;
const TEST_STEP_DELAY: Duration = Duration::from_millis(60);

const SHUTDOWN_ATTEMPTS: u32 = 3;
const SHUTDOWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One row of the step map: a tread's LED group wired to a chip channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinAssignment {
    pub step: Step,
    #[serde(with = "hex_address")]
    pub chip: u8,
    pub channel: u8,
}

mod hex_address {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chip: &u8, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{chip:02x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(&text);
        u8::from_str_radix(digits, 16)
            .map_err(|_| de::Error::custom(format!("invalid chip address {text:?}")))
    }
}

struct Inner {
    devices: BTreeMap<u8, Pca9685>,
    assignments: Vec<PinAssignment>,
    by_step: HashMap<Step, (u8, u8)>,
    brightness: HashMap<Step, Brightness>,
    /// Steps already complained about, so each unknown step logs once.
    unknown_steps: HashSet<Step>,
}

impl Inner {
    fn rebuild_lookup(&mut self) {
        self.by_step = self
            .assignments
            .iter()
            .map(|a| (a.step, (a.chip, a.channel)))
            .collect();
    }

    fn write_step(&mut self, step: Step, value: Brightness) {
        let Some(&(chip, channel)) = self.by_step.get(&step) else {
            if self.unknown_steps.insert(step) {
                warn!("ignoring write to unmapped step {step}");
            }
            return;
        };
        if let Some(device) = self.devices.get_mut(&chip) {
            if let Err(err) = device.set_duty(channel, value) {
                warn!("brightness write for step {step} failed: {err}");
            }
        }
        self.brightness.insert(step, value);
    }

    /// Writes in ascending (chip, channel) order so adjacent treads served
    /// by different chips update without visible tearing.
    fn write_sorted(&mut self, targets: &mut Vec<(u8, u8, Step, Brightness)>) {
        targets.sort_unstable_by_key(|&(chip, channel, _, _)| (chip, channel));
        for &(chip, channel, step, value) in targets.iter() {
            if let Some(device) = self.devices.get_mut(&chip) {
                if let Err(err) = device.set_duty(channel, value) {
                    warn!("brightness write for step {step} failed: {err}");
                }
            }
            self.brightness.insert(step, value);
        }
    }

    fn zero_assignments(&mut self) {
        let mut targets: Vec<_> = self
            .assignments
            .iter()
            .map(|a| (a.chip, a.channel, a.step, 0))
            .collect();
        self.write_sorted(&mut targets);
    }
}

/// Authoritative step to (chip, channel) routing plus the last-written
/// brightness per step. Sole writer to the PCA9685 devices; everything is
/// guarded by one lock so a mapping swap cannot interleave with a render
/// tick.
pub struct PinMapper {
    inner: Mutex<Inner>,
    shutdown_done: AtomicBool,
}

impl PinMapper {
    /// Scans the PCA9685 address window and returns responding chips.
    /// 0x70 is skipped; a MODE1 value above 0x7F is treated as a ghost.
    pub fn discover(bus: &SharedBus) -> Vec<u8> {
        let mut bus = bus.lock().unwrap_or_else(|e| e.into_inner());
        let mut found = Vec::new();
        for chip in ADDRESS_RANGE {
            if chip == GHOST_ADDRESS {
                continue;
            }
            match bus.read_register(chip, MODE1, 1) {
                Ok(bytes) if bytes.first().is_some_and(|&mode1| mode1 <= 0x7F) => {
                    debug!("found PCA9685 at 0x{chip:02x}");
                    found.push(chip);
                }
                _ => {}
            }
        }
        found
    }

    /// Builds and initializes a mapper over the discovered chips. An empty
    /// `stored` map yields the sequential default: ascending steps across
    /// each chip's 16 channels in discovery order.
    pub fn initialize(
        bus: SharedBus,
        discovered: &[u8],
        stored: &[PinAssignment],
        pwm_hz: u32,
        oscillator_hz: u32,
    ) -> Result<Self, Error> {
        if discovered.is_empty() {
            return Err(Error::NoDevices);
        }

        let mut devices = BTreeMap::new();
        for &chip in discovered {
            let mut device = Pca9685::new(bus.clone(), chip);
            device.initialize(oscillator_hz, pwm_hz)?;
            device.all_off()?;
            devices.insert(chip, device);
        }

        let assignments = if stored.is_empty() {
            default_mapping(discovered)
        } else {
            validate_mapping(stored, &devices)?;
            stored.to_vec()
        };
        info!(
            "pin mapper ready: {} chips, {} mapped steps",
            devices.len(),
            assignments.len()
        );

        let mut inner = Inner {
            devices,
            assignments,
            by_step: HashMap::new(),
            brightness: HashMap::new(),
            unknown_steps: HashSet::new(),
        };
        inner.rebuild_lookup();
        for step in inner.by_step.keys() {
            inner.brightness.insert(*step, 0);
        }

        Ok(Self {
            inner: Mutex::new(inner),
            shutdown_done: AtomicBool::new(false),
        })
    }

    /// Atomic replacement: zero every currently mapped channel, swap the
    /// map, zero every newly mapped channel. After return no channel from
    /// the previous mapping is lit.
    pub fn set_mapping(&self, new: Vec<PinAssignment>) -> Result<(), Error> {
        let mut inner = self.lock();
        validate_mapping(&new, &inner.devices)?;

        inner.zero_assignments();
        inner.assignments = new;
        inner.rebuild_lookup();
        inner.brightness.clear();
        inner.unknown_steps.clear();
        inner.zero_assignments();
        info!("pin mapping replaced: {} steps", inner.assignments.len());
        Ok(())
    }

    pub fn get_mapped_pin(&self, step: Step) -> Result<(u8, u8), Error> {
        self.lock()
            .by_step
            .get(&step)
            .copied()
            .ok_or(Error::UnknownStep { step })
    }

    /// Clamps, routes and writes one step. Unknown steps are dropped after
    /// logging once; chip failures are absorbed by the device layer.
    pub fn set_brightness(&self, step: Step, value: Brightness) {
        self.lock().write_step(step, value.min(MAX_BRIGHTNESS));
    }

    /// Fan-out over every mapped step.
    pub fn set_all(&self, value: Brightness) {
        let value = value.min(MAX_BRIGHTNESS);
        let mut inner = self.lock();
        let mut targets: Vec<_> = inner
            .assignments
            .iter()
            .map(|a| (a.chip, a.channel, a.step, value))
            .collect();
        inner.write_sorted(&mut targets);
    }

    /// Writes a rendered frame under one lock hold, ordered by
    /// (chip, channel). Steps outside the map are dropped (logged once).
    pub fn apply_frame(&self, frame: &BTreeMap<Step, Brightness>) {
        let mut inner = self.lock();
        let mut targets = Vec::with_capacity(frame.len());
        for (&step, &value) in frame {
            match inner.by_step.get(&step) {
                Some(&(chip, channel)) => {
                    targets.push((chip, channel, step, value.min(MAX_BRIGHTNESS)));
                }
                None => {
                    if inner.unknown_steps.insert(step) {
                        warn!("ignoring write to unmapped step {step}");
                    }
                }
            }
        }
        inner.write_sorted(&mut targets);
    }

    /// Last-written brightness; 0 for never-written or unmapped steps.
    pub fn brightness_of(&self, step: Step) -> Brightness {
        self.lock().brightness.get(&step).copied().unwrap_or(0)
    }

    /// Visible ramp across every mapped step, used as a bring-up self-test.
    pub fn test(&self) {
        info!("running LED self-test ramp");
        let mut steps: Vec<Step> = self.lock().by_step.keys().copied().collect();
        steps.sort_unstable();
        for step in steps {
            self.set_brightness(step, TEST_BRIGHTNESS);
            thread::sleep(TEST_STEP_DELAY);
            self.set_brightness(step, 0);
        }
    }

    /// Read-only per-chip channel table for external surfaces.
    pub fn driver_mappings(&self) -> BTreeMap<u8, Vec<Option<Step>>> {
        let inner = self.lock();
        let mut view: BTreeMap<u8, Vec<Option<Step>>> = inner
            .devices
            .keys()
            .map(|&chip| (chip, vec![None; CHANNELS as usize]))
            .collect();
        for assignment in &inner.assignments {
            if let Some(channels) = view.get_mut(&assignment.chip) {
                channels[assignment.channel as usize] = Some(assignment.step);
            }
        }
        view
    }

    pub fn chips(&self) -> Vec<u8> {
        self.lock().devices.keys().copied().collect()
    }

    pub fn mapping(&self) -> Vec<PinAssignment> {
        self.lock().assignments.clone()
    }

    /// Every channel off on every chip; resets the brightness cache.
    pub fn all_off(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let mut first_failure = None;
        for device in inner.devices.values_mut() {
            if let Err(err) = device.all_off() {
                first_failure.get_or_insert(err);
            }
        }
        let steps: Vec<Step> = inner.by_step.keys().copied().collect();
        for step in steps {
            inner.brightness.insert(step, 0);
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Best-effort darkening on process termination. Only the first caller
    /// does work; later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        for attempt in 1..=SHUTDOWN_ATTEMPTS {
            match self.all_off() {
                Ok(()) => {
                    info!("all LEDs off");
                    return;
                }
                Err(err) => {
                    warn!("shutdown all-off attempt {attempt} failed: {err}");
                    thread::sleep(SHUTDOWN_RETRY_DELAY);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn default_mapping(discovered: &[u8]) -> Vec<PinAssignment> {
    let mut assignments = Vec::with_capacity(discovered.len() * CHANNELS as usize);
    let mut step: Step = 1;
    for &chip in discovered {
        for channel in 0..CHANNELS {
            assignments.push(PinAssignment {
                step,
                chip,
                channel,
            });
            step += 1;
        }
    }
    assignments
}

fn validate_mapping(
    assignments: &[PinAssignment],
    devices: &BTreeMap<u8, Pca9685>,
) -> Result<(), Error> {
    let mut steps = HashSet::new();
    let mut pins = HashSet::new();
    for assignment in assignments {
        if assignment.step == 0 {
            return Err(Error::InvalidMapping {
                reason: "step numbers start at 1".into(),
            });
        }
        if assignment.channel >= CHANNELS {
            return Err(Error::InvalidMapping {
                reason: format!(
                    "channel {} out of range for step {}",
                    assignment.channel, assignment.step
                ),
            });
        }
        if !devices.contains_key(&assignment.chip) {
            return Err(Error::InvalidMapping {
                reason: format!(
                    "chip 0x{:02x} for step {} was not discovered",
                    assignment.chip, assignment.step
                ),
            });
        }
        if !steps.insert(assignment.step) {
            return Err(Error::InvalidMapping {
                reason: format!("step {} mapped twice", assignment.step),
            });
        }
        if !pins.insert((assignment.chip, assignment.channel)) {
            return Err(Error::InvalidMapping {
                reason: format!(
                    "channel {} on chip 0x{:02x} mapped twice",
                    assignment.channel, assignment.chip
                ),
            });
        }
    }
    Ok(())
}
