//! Frame codecs: raw sequence-numbered mode and legacy 7-bit-pair mode
//!
//! Both modes delimit messages with sysex-style start/end markers. The raw
//! mode embeds a 1-byte sequence number after the command id and carries the
//! payload verbatim; the legacy mode has no sequence numbers and re-encodes
//! every payload byte as two 7-bit bytes `(b & 0x7F, b >> 7)` so that marker
//! values can never appear inside a message.
//!
//! The codec is chosen once at connection setup. Binary payloads that may
//! contain the end-marker byte must use the legacy codec; raw-mode frames are
//! parsed scan-to-end-marker.

use tracing::warn;

/// Start marker of a legacy frame
pub const START_MARKER: u8 = 0xF0;
/// Variant bit ORed onto the start marker for raw-mode frames
pub const RAW_VARIANT: u8 = 0x01;
/// End marker shared by both modes
pub const END_MARKER: u8 = 0xF7;

/// One framed message: command id, optional sequence number, payload.
///
/// Frames are transient; one is built per send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub seq: Option<u8>,
    pub payload: Vec<u8>,
}

/// A malformed frame body. The frame is dropped; the connection stays up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Frame body shorter than the fixed header for this mode
    Truncated { len: usize },
    /// Legacy payload length is not a multiple of 2
    OddPairCount { len: usize },
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "frame body truncated ({len} bytes)"),
            Self::OddPairCount { len } => {
                write!(f, "legacy payload has odd length {len}, cannot recombine pairs")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// A framing strategy selected at connection setup.
///
/// `encode` produces the full wire message including markers; `decode_body`
/// receives the bytes between the markers as collected by [`FrameReader`].
pub trait FrameCodec: Send + Sync {
    /// Start-marker byte this codec emits and accepts
    fn start_byte(&self) -> u8;

    /// Whether frames in this mode carry a sequence number
    fn uses_sequence_numbers(&self) -> bool;

    /// Encode a frame to wire bytes
    fn encode(&self, frame: &Frame) -> Vec<u8>;

    /// Decode the bytes between start and end markers
    fn decode_body(&self, body: &[u8]) -> Result<Frame, FramingError>;
}

/// Modern codec: raw payload bytes plus an embedded 1-byte sequence number.
///
/// Wire format: `[0xF1][command][seq]<payload>[0xF7]`
#[derive(Debug, Default)]
pub struct RawCodec;

impl FrameCodec for RawCodec {
    fn start_byte(&self) -> u8 {
        START_MARKER | RAW_VARIANT
    }

    fn uses_sequence_numbers(&self) -> bool {
        true
    }

    fn encode(&self, frame: &Frame) -> Vec<u8> {
        let mut out = Vec::with_capacity(frame.payload.len() + 4);
        out.push(self.start_byte());
        out.push(frame.command);
        out.push(frame.seq.unwrap_or(0));
        out.extend_from_slice(&frame.payload);
        out.push(END_MARKER);
        out
    }

    fn decode_body(&self, body: &[u8]) -> Result<Frame, FramingError> {
        if body.len() < 2 {
            return Err(FramingError::Truncated { len: body.len() });
        }
        Ok(Frame {
            command: body[0],
            seq: Some(body[1]),
            payload: body[2..].to_vec(),
        })
    }
}

/// Legacy codec: every payload byte becomes two 7-bit bytes, no sequence
/// numbers.
///
/// Wire format: `[0xF0][command]<payload as (b & 0x7F, b >> 7) pairs>[0xF7]`
#[derive(Debug, Default)]
pub struct LegacyCodec;

impl FrameCodec for LegacyCodec {
    fn start_byte(&self) -> u8 {
        START_MARKER
    }

    fn uses_sequence_numbers(&self) -> bool {
        false
    }

    fn encode(&self, frame: &Frame) -> Vec<u8> {
        let mut out = Vec::with_capacity(frame.payload.len() * 2 + 3);
        out.push(self.start_byte());
        out.push(frame.command);
        for &b in &frame.payload {
            out.push(b & 0x7F);
            out.push(b >> 7);
        }
        out.push(END_MARKER);
        out
    }

    fn decode_body(&self, body: &[u8]) -> Result<Frame, FramingError> {
        if body.is_empty() {
            return Err(FramingError::Truncated { len: 0 });
        }
        let pairs = &body[1..];
        if pairs.len() % 2 != 0 {
            return Err(FramingError::OddPairCount { len: pairs.len() });
        }
        let payload = pairs
            .chunks_exact(2)
            .map(|p| p[0] | (p[1] << 7))
            .collect();
        Ok(Frame {
            command: body[0],
            seq: None,
            payload,
        })
    }
}

/// Incremental frame parser fed one byte at a time by the reader loop.
///
/// Bytes outside a frame that are not this codec's start marker are ignored,
/// which also absorbs the transport's `0` timeout sentinel. Oversize bodies
/// are discarded without ending the connection.
pub struct FrameReader {
    start_byte: u8,
    max_body: usize,
    body: Option<Vec<u8>>,
}

impl FrameReader {
    /// Create a reader for the given codec's start marker.
    ///
    /// `max_body` bounds the collected body (command + seq + payload bytes);
    /// anything larger is treated as line noise and dropped.
    pub fn new(start_byte: u8, max_body: usize) -> Self {
        Self {
            start_byte,
            max_body,
            body: None,
        }
    }

    /// Push one byte; returns a complete frame body when the end marker
    /// arrives.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.body {
            None => {
                if byte == self.start_byte {
                    self.body = Some(Vec::new());
                }
                None
            }
            Some(ref mut body) => {
                if byte == END_MARKER {
                    return self.body.take();
                }
                body.push(byte);
                if body.len() > self.max_body {
                    warn!("frame body exceeded {} bytes, dropping", self.max_body);
                    self.body = None;
                }
                None
            }
        }
    }

    /// Whether the reader is mid-frame
    pub fn in_frame(&self) -> bool {
        self.body.is_some()
    }
}
