//! Device-level error types

use polykb_transport::TransportError;
use thiserror::Error;

use crate::schema::SchemaError;

/// Errors from device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Transport layer error (often recoverable by reopening)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Structure schema problem (unknown struct, bad field)
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// No response within the bounded wait, retries exhausted
    #[error("No response from device")]
    Timeout,

    /// Nonzero acknowledgement status during a chunked upload
    #[error("Upload rejected with status 0x{status:02X}")]
    Upload { status: u8 },

    /// Device reported a nonzero status for a command
    #[error("Command rejected with status 0x{status:02X}")]
    CommandRejected { status: u8 },

    /// The device handle was closed while the request was outstanding
    #[error("Device disconnected")]
    Disconnected,

    /// Invalid parameter value
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
