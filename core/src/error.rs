//! NPU driver error types.
//!
//! Only recoverable conditions live here. Breaking the slot state machine
//! (e.g. `write_buf` on a full slot) is a contract violation and panics.

use core::fmt;

use axerrno::AxError;

/// NPU driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpuError {
    /// The buffer window configuration was rejected.
    InvalidConfig(&'static str),
    /// Record sizes that do not fit a single slot.
    InvalidRecordSize {
        /// Input record size in bytes.
        input: usize,
        /// Output record size in bytes.
        output: usize,
    },
    /// The ring still has outstanding slots.
    Busy,
    /// A bounded wait gave up before the accelerator marked the slot ready.
    Timeout {
        /// Slot the driver was waiting on.
        slot: usize,
    },
    /// The device singleton has not been initialized.
    NotInitialized,
    /// The device singleton was already initialized.
    AlreadyInitialized,
}

impl NpuError {
    /// Get the error code (Linux errno style).
    pub fn as_errno(&self) -> i32 {
        match self {
            NpuError::InvalidConfig(_) => -22,           // EINVAL
            NpuError::InvalidRecordSize { .. } => -22,   // EINVAL
            NpuError::Busy => -16,                       // EBUSY
            NpuError::Timeout { .. } => -110,            // ETIMEDOUT
            NpuError::NotInitialized => -19,             // ENODEV
            NpuError::AlreadyInitialized => -17,         // EEXIST
        }
    }
}

impl fmt::Display for NpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => write!(f, "Invalid window configuration: {reason}"),
            Self::InvalidRecordSize { input, output } => write!(
                f,
                "Record sizes do not fit a slot: input={input}, output={output}"
            ),
            Self::Busy => write!(f, "Buffer ring has outstanding slots"),
            Self::Timeout { slot } => write!(f, "Timed out waiting for slot {slot}"),
            Self::NotInitialized => write!(f, "NPU device not initialized"),
            Self::AlreadyInitialized => write!(f, "NPU device already initialized"),
        }
    }
}

impl From<NpuError> for AxError {
    fn from(err: NpuError) -> Self {
        match err {
            NpuError::InvalidConfig(_) | NpuError::InvalidRecordSize { .. } => {
                AxError::InvalidInput
            }
            NpuError::Busy | NpuError::AlreadyInitialized => AxError::AlreadyExists,
            NpuError::Timeout { .. } => AxError::Interrupted,
            NpuError::NotInitialized => AxError::NotFound,
        }
    }
}

pub type NpuResult<T> = Result<T, NpuError>;
