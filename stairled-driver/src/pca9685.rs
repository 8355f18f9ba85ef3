use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::SharedBus;
use crate::error::Error;
use crate::throttle::Throttle;
use crate::{Brightness, MAX_BRIGHTNESS};

pub const MODE1: u8 = 0x00;
pub const LED0_ON_L: u8 = 0x06;
pub const ALL_LED_OFF_L: u8 = 0xFC;
pub const PRE_SCALE: u8 = 0xFE;

/// PWM outputs per chip.
pub const CHANNELS: u8 = 16;

const MODE1_RESTART: u8 = 0x80;
const MODE1_AUTO_INCREMENT: u8 = 0x20;
const MODE1_SLEEP: u8 = 0x10;

/// Bit 4 of the LEDn_ON_H / LEDn_OFF_H registers.
const FULL_BIT: u8 = 0x10;

/// PRE_SCALE accepts 3..=255 per the datasheet.
const PRE_SCALE_MIN: u8 = 0x03;

/// How often a degraded chip re-probes and logs while writes are suppressed.
const DEGRADED_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// One PCA9685 at a fixed bus address.
///
/// A chip that fails a transfer is marked degraded: the first failure
/// surfaces as an error, later writes become no-ops until a probe succeeds
/// again, so one dead chip cannot stall the render tick.
pub struct Pca9685 {
    bus: SharedBus,
    address: u8,
    degraded: bool,
    degraded_log: Throttle,
}

impl Pca9685 {
    pub fn new(bus: SharedBus, address: u8) -> Self {
        Self {
            bus,
            address,
            degraded: false,
            degraded_log: Throttle::new(DEGRADED_LOG_INTERVAL),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// MODE1 reset, sleep, PRE_SCALE program, restart with auto-increment.
    /// The chip needs 500µs after wake-up before RESTART may be set.
    pub fn initialize(&mut self, oscillator_hz: u32, target_pwm_hz: u32) -> Result<(), Error> {
        let prescale = prescale_for(oscillator_hz, target_pwm_hz);

        self.write(MODE1, &[0x00])?;
        self.write(MODE1, &[MODE1_SLEEP])?;
        self.write(PRE_SCALE, &[prescale])?;
        self.write(MODE1, &[0x00])?;
        thread::sleep(Duration::from_micros(500));
        self.write(MODE1, &[MODE1_RESTART | MODE1_AUTO_INCREMENT])?;

        info!(
            "PCA9685 0x{:02x} initialized at {} Hz (prescale {})",
            self.address, target_pwm_hz, prescale
        );
        Ok(())
    }

    /// Programs one channel's on/off counts. The usual brightness form is
    /// `on = 0, off = duty`; see [`Pca9685::set_duty`].
    pub fn set_channel(&mut self, channel: u8, on: u16, off: u16) -> Result<(), Error> {
        debug_assert!(channel < CHANNELS);
        let on = on.min(MAX_BRIGHTNESS);
        let off = off.min(MAX_BRIGHTNESS);
        self.write_guarded(
            LED0_ON_L + 4 * channel,
            &[
                (on & 0xff) as u8,
                (on >> 8) as u8,
                (off & 0xff) as u8,
                (off >> 8) as u8,
            ],
        )
    }

    /// Brightness write with the datasheet's full-on/full-off special cases
    /// for the two duty extremes.
    pub fn set_duty(&mut self, channel: u8, brightness: Brightness) -> Result<(), Error> {
        debug_assert!(channel < CHANNELS);
        let brightness = brightness.min(MAX_BRIGHTNESS);
        let registers = match brightness {
            0 => [0x00, 0x00, 0x00, FULL_BIT],
            MAX_BRIGHTNESS => [0x00, FULL_BIT, 0x00, 0x00],
            duty => [0x00, 0x00, (duty & 0xff) as u8, (duty >> 8) as u8],
        };
        self.write_guarded(LED0_ON_L + 4 * channel, &registers)
    }

    /// Turns every channel off through the ALL_LED registers. Not gated on
    /// the degraded flag so shutdown retries get a chance to land.
    pub fn all_off(&mut self) -> Result<(), Error> {
        self.write(ALL_LED_OFF_L, &[0x00, FULL_BIT])
    }

    /// All channels off, then drop the bus handle.
    pub fn close(mut self) -> Result<(), Error> {
        self.all_off()
    }

    /// MODE1 read. A success clears the degraded flag.
    pub fn probe(&mut self) -> bool {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        let responsive = bus.probe(self.address);
        if responsive && self.degraded {
            info!("chip 0x{:02x} recovered, resuming writes", self.address);
            self.degraded = false;
        }
        responsive
    }

    fn write(&mut self, register: u8, bytes: &[u8]) -> Result<(), Error> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        bus.write_register(self.address, register, bytes)
            .map_err(|source| Error::Bus {
                chip: self.address,
                source,
            })
    }

    fn write_guarded(&mut self, register: u8, bytes: &[u8]) -> Result<(), Error> {
        if self.degraded {
            if self.degraded_log.allow() && !self.probe() {
                warn!("chip 0x{:02x} unresponsive, writes suppressed", self.address);
            }
            if self.degraded {
                return Ok(());
            }
        }
        match self.write(register, bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.degraded = true;
                Err(err)
            }
        }
    }
}

fn prescale_for(oscillator_hz: u32, target_pwm_hz: u32) -> u8 {
    let exact = oscillator_hz as f64 / (4096.0 * target_pwm_hz.max(1) as f64);
    let rounded = exact.round() as i64 - 1;
    rounded.clamp(PRE_SCALE_MIN as i64, u8::MAX as i64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;

    fn chip(addresses: &[u8]) -> (Pca9685, std::sync::Arc<std::sync::Mutex<crate::bus::mock::MockState>>)
    {
        let (bus, state) = MockBus::with_chips(addresses);
        (Pca9685::new(bus.into_shared(), addresses[0]), state)
    }

    #[test]
    fn prescale_matches_datasheet_example() {
        // 25 MHz oscillator at 200 Hz output -> 0x1E
        assert_eq!(prescale_for(25_000_000, 200), 30);
    }

    #[test]
    fn prescale_clamps_to_hardware_range() {
        assert_eq!(prescale_for(27_000_000, 52_000), PRE_SCALE_MIN);
        assert_eq!(prescale_for(27_000_000, 1), u8::MAX);
    }

    #[test]
    fn initialize_programs_prescale_and_restarts() {
        let (mut device, state) = chip(&[0x40]);
        device.initialize(25_000_000, 200).unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.register(0x40, PRE_SCALE), 30);
        assert_eq!(
            state.register(0x40, MODE1),
            MODE1_RESTART | MODE1_AUTO_INCREMENT
        );
    }

    #[test]
    fn duty_extremes_use_full_bits() {
        let (mut device, state) = chip(&[0x40]);
        device.set_duty(3, 0).unwrap();
        device.set_duty(4, MAX_BRIGHTNESS).unwrap();
        device.set_duty(5, 2000).unwrap();

        let state = state.lock().unwrap();
        let base3 = LED0_ON_L + 12;
        assert_eq!(state.register(0x40, base3 + 3), FULL_BIT); // full off
        let base4 = LED0_ON_L + 16;
        assert_eq!(state.register(0x40, base4 + 1), FULL_BIT); // full on
        let base5 = LED0_ON_L + 20;
        assert_eq!(state.register(0x40, base5 + 2), (2000 & 0xff) as u8);
        assert_eq!(state.register(0x40, base5 + 3), (2000 >> 8) as u8);
    }

    #[test]
    fn duty_clamps_out_of_range_values() {
        let (mut device, state) = chip(&[0x40]);
        device.set_channel(0, 0, 9000).unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.register(0x40, LED0_ON_L + 2), (4095 & 0xff) as u8);
        assert_eq!(state.register(0x40, LED0_ON_L + 3), (4095 >> 8) as u8);
    }

    #[test]
    fn first_failure_surfaces_then_writes_become_noops() {
        let (bus, state) = MockBus::with_chips(&[0x40]);
        let mut device = Pca9685::new(bus.into_shared(), 0x40);

        state.lock().unwrap().failing.push(0x40);
        assert!(device.set_duty(0, 100).is_err());
        assert!(device.is_degraded());

        // later writes are swallowed and nothing reaches the bus
        let before = state.lock().unwrap().writes.len();
        device.set_duty(0, 200).unwrap();
        assert_eq!(state.lock().unwrap().writes.len(), before);
    }

    #[test]
    fn successful_probe_clears_degradation() {
        let (bus, state) = MockBus::with_chips(&[0x40]);
        let mut device = Pca9685::new(bus.into_shared(), 0x40);

        state.lock().unwrap().failing.push(0x40);
        assert!(device.set_duty(0, 100).is_err());

        state.lock().unwrap().failing.clear();
        assert!(device.probe());
        assert!(!device.is_degraded());

        device.set_duty(0, 300).unwrap();
        let state = state.lock().unwrap();
        assert_eq!(state.register(0x40, LED0_ON_L + 2), (300 & 0xff) as u8);
    }
}
