//! # Error Types Module
//!
//! Centralized error handling for the recorder.
//! Provides custom error types for each layer with proper context and error chaining.
//!
//! ## Error Types
//! - `TransportError`: failures reported by the BLE transport capability
//! - `RecorderError`: session controller outcomes surfaced to the presentation layer
//! - `PersistError`: session file I/O and (de)serialization failures
//! - `ConfigError`: configuration file I/O and parsing errors
//!
//! ## Recovery Policy
//! Only connect exhaustion reaches the user as an error. Stream-stop, battery
//! and persistence failures are logged and the session carries on.

use std::fmt;
use std::path::PathBuf;

use crate::controller::SessionState;

/// Errors reported by a BLE transport implementation
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Bluetooth adapter not found or not available
    NoAdapter,
    /// Generic failure from the underlying BLE stack
    Ble(String),
    /// A required GATT characteristic is not exposed by the device
    CharacteristicMissing(uuid::Uuid),
    /// No peripheral with this address is known to the adapter
    NotFound(String),
    /// Operation did not complete in time
    Timeout,
    /// The transport does not implement this operation
    Unsupported,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoAdapter => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            TransportError::Ble(msg) => write!(f, "Bluetooth error: {}", msg),
            TransportError::CharacteristicMissing(uuid) => {
                write!(f, "Characteristic {} not found on device", uuid)
            }
            TransportError::NotFound(address) => write!(f, "Peripheral {} not found", address),
            TransportError::Timeout => write!(f, "Bluetooth operation timed out"),
            TransportError::Unsupported => write!(f, "Operation not supported by transport"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        TransportError::Ble(err.to_string())
    }
}

/// Errors produced by session controller operations
#[derive(Debug)]
pub enum RecorderError {
    /// Address could not be resolved by a targeted lookup or a full scan
    DeviceNotFound(String),
    /// Address is already claimed by this process
    DeviceBusy(String),
    /// Every connect attempt failed
    ConnectFailed {
        address: String,
        attempts: u32,
        reason: TransportError,
    },
    /// Recording requested without a live link
    NotConnected,
    /// Request not valid in the current controller state
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
    /// Unsubscribing from the heart rate stream failed
    StreamStopFailed(TransportError),
    /// Battery level could not be read
    BatteryReadFailed(TransportError),
    /// Device discovery failed
    Scan(TransportError),
    /// Session file could not be opened or written
    Persist(PersistError),
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::DeviceNotFound(address) => {
                write!(f, "Device {} not found", address)
            }
            RecorderError::DeviceBusy(address) => {
                write!(f, "Device {} already in use in this app (busy)", address)
            }
            RecorderError::ConnectFailed {
                address,
                attempts,
                reason,
            } => write!(
                f,
                "Failed to connect to {} after {} attempts: {}",
                address, attempts, reason
            ),
            RecorderError::NotConnected => write!(f, "Not connected to device."),
            RecorderError::InvalidState { action, state } => {
                write!(f, "Cannot {} while {:?}", action, state)
            }
            RecorderError::StreamStopFailed(e) => {
                write!(f, "Failed to stop heart rate stream: {}", e)
            }
            RecorderError::BatteryReadFailed(e) => write!(f, "Failed to read battery: {}", e),
            RecorderError::Scan(e) => write!(f, "Scan error: {}", e),
            RecorderError::Persist(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RecorderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecorderError::ConnectFailed { reason, .. } => Some(reason),
            RecorderError::StreamStopFailed(e)
            | RecorderError::BatteryReadFailed(e)
            | RecorderError::Scan(e) => Some(e),
            RecorderError::Persist(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistError> for RecorderError {
    fn from(err: PersistError) -> Self {
        RecorderError::Persist(err)
    }
}

/// Errors that can occur while persisting a session
#[derive(Debug)]
pub enum PersistError {
    /// Failed to create the output directory or read/write the session file
    Io(std::io::Error),
    /// Failed to serialize the session record
    Serialize(serde_json::Error),
    /// Existing session file could not be parsed
    Corrupt { path: PathBuf, reason: String },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "Session file I/O failed: {}", e),
            PersistError::Serialize(e) => write!(f, "Failed to serialize session: {}", e),
            PersistError::Corrupt { path, reason } => {
                write!(f, "Session file {} is unreadable: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::Io(e) => Some(e),
            PersistError::Serialize(e) => Some(e),
            PersistError::Corrupt { .. } => None,
        }
    }
}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        PersistError::Io(err)
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}
