//! Transport abstraction layer for polykb keyboard communication
//!
//! This crate provides a unified byte-channel interface for talking to
//! polykb keyboards across different transport backends:
//!
//! - Serial (classic line-oriented channel at a fixed baud rate)
//! - Raw HID (fixed-size report channel with chunking and reassembly)
//!
//! plus the frame codecs that delimit protocol messages on those channels.

pub mod error;
pub mod framing;
pub mod protocol;
pub mod types;

mod raw_hid;
mod serial;

pub use error::TransportError;
pub use framing::{
    Frame, FrameCodec, FrameReader, FramingError, LegacyCodec, RawCodec, END_MARKER, RAW_VARIANT,
    START_MARKER,
};
pub use raw_hid::{RawHidTransport, REPORT_MARKER};
pub use serial::SerialTransport;
pub use types::{Endianness, TransportInfo, TransportKind};

use std::sync::Arc;

/// The core transport trait — all backends implement this.
///
/// One continuous polling loop drives the read path; a handle must not be
/// shared across reader threads.
pub trait Transport: Send + Sync {
    /// Write one application message. Against a closed handle this makes
    /// exactly one reopen attempt before failing.
    fn write(&self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Read one byte, blocking up to the device-defined timeout.
    ///
    /// Returns the sentinel `0` on timeout — callers must tolerate silent
    /// gaps. A read timeout is not an error.
    fn read_byte(&self) -> u8;

    /// Close the handle. Flushes nothing and never fails, even on a
    /// transport that is already closed.
    fn close(&self);

    /// Device identification
    fn info(&self) -> &TransportInfo;

    /// Net capacity of one outgoing message on this transport
    fn max_message_len(&self) -> usize;
}

/// Type alias for a shared transport handle
pub type SharedTransport = Arc<dyn Transport>;
