use crate::bus::BusError;
use crate::Step;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i2c failure on chip 0x{chip:02x}: {source}")]
    Bus {
        chip: u8,
        #[source]
        source: BusError,
    },

    #[error("invalid pin mapping: {reason}")]
    InvalidMapping { reason: String },

    #[error("step {step} is not in the pin map")]
    UnknownStep { step: Step },

    #[error("no PCA9685 devices responded on the bus")]
    NoDevices,
}
