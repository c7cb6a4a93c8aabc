//! Transport error types

use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Reopen failed: {0}")]
    ReopenFailed(String),

    #[error("Message too large: {len} bytes, transport carries at most {max}")]
    MessageTooLarge { len: usize, max: usize },

    // HID-specific errors
    #[error("HID error: {0}")]
    Hid(String),

    #[error("HID permission denied: {0}")]
    HidPermissionDenied(String),

    // Serial-specific errors
    #[error("Serial error: {0}")]
    Serial(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<hidapi::HidError> for TransportError {
    fn from(e: hidapi::HidError) -> Self {
        let msg = e.to_string();
        if msg.contains("Permission denied") || msg.contains("EPERM") {
            TransportError::HidPermissionDenied(msg)
        } else {
            TransportError::Hid(msg)
        }
    }
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(e.to_string()),
            _ => TransportError::Serial(e.to_string()),
        }
    }
}
