use thiserror::Error;

use crate::trim_table::OperatingBucket;

#[derive(Debug, Error)]
pub enum BoostError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("trim {requested} for bucket {bucket} exceeds bound {bound}")]
    TrimBoundViolation {
        bucket: OperatingBucket,
        requested: f32,
        bound: f32,
    },

    #[error("operating bucket index {0} out of range")]
    InvalidBucket(u8),

    #[error("scramble override is disabled")]
    ScrambleDisabled,

    #[error("duty output failed: {0}")]
    DutyOutput(String),

    #[error("telemetry export failed: {0}")]
    Telemetry(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("access of {len} bytes at {address:#010x} is beyond capacity {capacity}")]
    OutOfBounds { address: u32, len: usize, capacity: u32 },

    #[error("device fault: {0}")]
    Device(String),

    #[error("record of {len} bytes does not fit slot of {slot_size} bytes")]
    RecordTooLarge { len: usize, slot_size: u32 },

    #[error("trim record encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("trim record header: {0}")]
    Header(#[from] std::io::Error),
}

impl BoostError {
    pub fn config(msg: impl Into<String>) -> Self {
        BoostError::InvalidConfiguration(msg.into())
    }
}
