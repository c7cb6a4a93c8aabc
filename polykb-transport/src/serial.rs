//! Serial transport implementation (classic line-oriented byte channel)

use std::io::{Read, Write};
use std::time::Duration;

use parking_lot::Mutex;
use serialport::SerialPort;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::timing;
use crate::types::{TransportInfo, TransportKind};
use crate::Transport;

/// Largest message accepted for a single serial write. The serial line does
/// no chunking; the device-side config bounds real frames far below this.
const MAX_SERIAL_MESSAGE: usize = 1024;

/// Byte transport over a serial line at a fixed baud rate
pub struct SerialTransport {
    port: Mutex<Option<Box<dyn SerialPort>>>,
    path: String,
    baud: u32,
    info: TransportInfo,
}

impl SerialTransport {
    /// Open a serial port. An open failure is fatal to the connection
    /// attempt; it is reported, not retried.
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let port = Self::open_port(path, baud)?;
        debug!("opened serial port {} at {} baud", path, baud);
        Ok(Self {
            port: Mutex::new(Some(port)),
            path: path.to_string(),
            baud,
            info: TransportInfo {
                kind: TransportKind::Serial,
                vid: 0,
                pid: 0,
                path: path.to_string(),
                product_name: None,
            },
        })
    }

    fn open_port(path: &str, baud: u32) -> Result<Box<dyn SerialPort>, TransportError> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(timing::READ_TIMEOUT_MS))
            .open()?;
        Ok(port)
    }
}

impl Transport for SerialTransport {
    fn write(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        if bytes.len() > MAX_SERIAL_MESSAGE {
            return Err(TransportError::MessageTooLarge {
                len: bytes.len(),
                max: MAX_SERIAL_MESSAGE,
            });
        }
        let mut guard = self.port.lock();
        if guard.is_none() {
            // One reopen attempt against a closed handle, then fail
            debug!("serial port closed, attempting reopen of {}", self.path);
            match Self::open_port(&self.path, self.baud) {
                Ok(port) => *guard = Some(port),
                Err(e) => return Err(TransportError::ReopenFailed(e.to_string())),
            }
        }
        let Some(port) = guard.as_mut() else {
            return Err(TransportError::Disconnected);
        };
        match port.write_all(bytes) {
            Ok(()) => Ok(bytes.len()),
            Err(e) => {
                warn!("serial write failed: {}", e);
                *guard = None;
                Err(TransportError::Serial(e.to_string()))
            }
        }
    }

    fn read_byte(&self) -> u8 {
        let mut guard = self.port.lock();
        let Some(port) = guard.as_mut() else {
            return 0;
        };
        let mut buf = [0u8; 1];
        match port.read(&mut buf) {
            Ok(1) => buf[0],
            Ok(_) => 0,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => {
                warn!("serial read failed: {}", e);
                0
            }
        }
    }

    fn close(&self) {
        // Best-effort protocol: nothing to flush, safe on an already
        // closed handle.
        self.port.lock().take();
    }

    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn max_message_len(&self) -> usize {
        MAX_SERIAL_MESSAGE
    }
}
