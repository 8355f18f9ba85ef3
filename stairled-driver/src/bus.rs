use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use i2cdev::core::I2CDevice;
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};

/// Register 0 on every PCA9685; probing reads it.
const PROBE_REGISTER: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("i2c: {0}")]
    Linux(#[from] LinuxI2CError),

    #[error("i2c transfer failed: {0}")]
    Transfer(String),
}

/// Byte-level access to one I²C bus.
///
/// All operations are blocking. Callers share the bus through [`SharedBus`]
/// and are serialized by its lock. This layer never retries; retry policy
/// belongs to the device layer above.
pub trait I2cBus: Send {
    fn write_register(&mut self, chip: u8, register: u8, bytes: &[u8]) -> Result<(), BusError>;

    fn read_register(&mut self, chip: u8, register: u8, len: u8) -> Result<Vec<u8>, BusError>;

    /// Attempts a MODE1 read and reports whether the device answered.
    fn probe(&mut self, chip: u8) -> bool {
        self.read_register(chip, PROBE_REGISTER, 1).is_ok()
    }
}

pub type SharedBus = Arc<Mutex<dyn I2cBus>>;

/// `/dev/i2c-N` gateway. Device handles are opened lazily per chip address
/// and kept for the life of the bus.
pub struct LinuxBus {
    path: String,
    devices: HashMap<u8, LinuxI2CDevice>,
}

impl LinuxBus {
    pub fn open(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            devices: HashMap::new(),
        }
    }

    fn device(&mut self, chip: u8) -> Result<&mut LinuxI2CDevice, BusError> {
        match self.devices.entry(chip) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let device = LinuxI2CDevice::new(&self.path, chip as u16)?;
                Ok(entry.insert(device))
            }
        }
    }
}

impl I2cBus for LinuxBus {
    fn write_register(&mut self, chip: u8, register: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.device(chip)?
            .smbus_write_i2c_block_data(register, bytes)?;
        Ok(())
    }

    fn read_register(&mut self, chip: u8, register: u8, len: u8) -> Result<Vec<u8>, BusError> {
        let bytes = self.device(chip)?.smbus_read_i2c_block_data(register, len)?;
        Ok(bytes)
    }
}

/// In-memory bus double for tests in this crate and downstream.
pub mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::{BusError, I2cBus, SharedBus};

    #[derive(Debug, Default)]
    pub struct MockState {
        /// Last bytes written per (chip, register).
        pub registers: HashMap<(u8, u8), Vec<u8>>,
        /// Every write in arrival order.
        pub writes: Vec<(u8, u8, Vec<u8>)>,
        /// Chips that answer reads and writes.
        pub present: Vec<u8>,
        /// Chips that currently error on every transfer.
        pub failing: Vec<u8>,
    }

    impl MockState {
        /// Single register byte, 0 when never written.
        pub fn register(&self, chip: u8, register: u8) -> u8 {
            self.registers
                .get(&(chip, register))
                .and_then(|bytes| bytes.first().copied())
                .unwrap_or(0)
        }
    }

    pub struct MockBus {
        state: Arc<Mutex<MockState>>,
    }

    impl MockBus {
        /// Builds a bus with the given chips present, plus a handle for
        /// inspecting traffic after the bus has been moved behind a lock.
        pub fn with_chips(chips: &[u8]) -> (Self, Arc<Mutex<MockState>>) {
            let state = Arc::new(Mutex::new(MockState {
                present: chips.to_vec(),
                ..MockState::default()
            }));
            (
                Self {
                    state: Arc::clone(&state),
                },
                state,
            )
        }

        pub fn into_shared(self) -> SharedBus {
            Arc::new(Mutex::new(self))
        }
    }

    impl I2cBus for MockBus {
        fn write_register(&mut self, chip: u8, register: u8, bytes: &[u8]) -> Result<(), BusError> {
            let mut state = self.state.lock().unwrap();
            if state.failing.contains(&chip) {
                return Err(BusError::Transfer(format!("chip 0x{chip:02x} write failed")));
            }
            if !state.present.contains(&chip) {
                return Err(BusError::Transfer(format!("no ack from 0x{chip:02x}")));
            }
            // auto-increment across registers, one byte per register
            for (i, &byte) in bytes.iter().enumerate() {
                state
                    .registers
                    .insert((chip, register + i as u8), vec![byte]);
            }
            state.writes.push((chip, register, bytes.to_vec()));
            Ok(())
        }

        fn read_register(&mut self, chip: u8, register: u8, len: u8) -> Result<Vec<u8>, BusError> {
            let state = self.state.lock().unwrap();
            if state.failing.contains(&chip) {
                return Err(BusError::Transfer(format!("chip 0x{chip:02x} read failed")));
            }
            if !state.present.contains(&chip) {
                return Err(BusError::Transfer(format!("no ack from 0x{chip:02x}")));
            }
            let mut out = Vec::with_capacity(len as usize);
            for i in 0..len {
                out.push(state.register(chip, register + i));
            }
            Ok(out)
        }
    }
}
