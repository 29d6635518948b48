use crate::types::DeviceId;
use thiserror::Error;

/// Errors produced while decoding characteristic payloads.
///
/// These never escape as panics: the notification pump logs the offending
/// payload and drops it, and the stream continues with the next notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The payload contained no bytes at all.
    #[error("empty payload")]
    Empty,

    /// The payload ended before the advertised fields.
    #[error("truncated payload: needed {required} bytes, got {actual}")]
    Truncated {
        /// Bytes the flags demanded.
        required: usize,
        /// Bytes actually present.
        actual: usize,
    },
}

/// Errors surfaced by the BLE transport backend.
#[derive(Error, Debug)]
pub enum HardwareError {
    /// Bluetooth Low Energy stack error.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Backend-specific failure with no richer classification.
    #[error("backend error: {0}")]
    Backend(String),

    /// No usable Bluetooth adapter on this system.
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
}

/// Errors that can occur while establishing a connection.
///
/// Every kind is retryable: the reconnection controller schedules the next
/// attempt regardless of which variant the previous attempt produced.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The connect attempt did not complete in time.
    #[error("connection timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Service discovery finished without exposing the Heart Rate service.
    #[error("device does not expose the Heart Rate service")]
    ServiceNotFound,

    /// The Heart Rate service is present but the measurement characteristic
    /// is missing.
    #[error("device is missing the heart rate measurement characteristic")]
    CharacteristicNotFound,

    /// The requested device is in neither the scan registry nor the
    /// platform's known-device list.
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// The transport backend failed.
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl ConnectError {
    /// Short user-facing guidance for surfacing this failure in a UI.
    #[must_use]
    pub const fn guidance(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => {
                "Connection timed out. Check that the monitor is powered on, \
                 worn, and within range."
            }
            Self::ServiceNotFound | Self::CharacteristicNotFound => {
                "This device does not appear to be a heart rate monitor. \
                 Select a different device."
            }
            Self::DeviceNotFound(_) => {
                "Device not found. Run a new scan and select the monitor again."
            }
            Self::Hardware(_) => {
                "A Bluetooth error occurred. Check that Bluetooth is enabled \
                 and try again."
            }
        }
    }

    /// Check if this error is a connect timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error means the device is not a usable heart-rate
    /// monitor (wrong device rather than bad conditions).
    #[must_use]
    pub const fn is_wrong_device(&self) -> bool {
        matches!(self, Self::ServiceNotFound | Self::CharacteristicNotFound)
    }
}

/// Errors from the settings persistence backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing store rejected or failed the operation.
    #[error("settings store error: {0}")]
    Backend(String),

    /// IO error from a file-backed store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
