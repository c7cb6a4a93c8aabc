//! Raw HID transport implementation
//!
//! Wraps a fixed-size (`epsize`) report channel. Every application message is
//! prefixed with a 2-byte report header (report id 0, message-type marker
//! 0xFA) and split so that each outgoing report carries at most `epsize - 2`
//! payload bytes. On read, the marker byte is stripped and payload bytes are
//! appended to an internal buffer that `read_byte()` drains one byte at a
//! time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::timing;
use crate::types::{TransportInfo, TransportKind};
use crate::Transport;

/// Message-type marker carried in byte 1 of every report
pub const REPORT_MARKER: u8 = 0xFA;

/// Byte transport over raw HID reports
#[derive(Debug)]
pub struct RawHidTransport {
    device: Mutex<Option<HidDevice>>,
    read_buf: Mutex<VecDeque<u8>>,
    read_failures: AtomicUsize,
    epsize: usize,
    info: TransportInfo,
}

impl RawHidTransport {
    /// Open the first HID device matching `vid:pid`.
    ///
    /// `epsize` is the report size of the device's raw endpoint (commonly
    /// 32 or 64). An open failure is fatal to the connection attempt.
    pub fn open(vid: u16, pid: u16, epsize: usize) -> Result<Self, TransportError> {
        // Two header bytes plus at least one payload byte per report
        if epsize < 3 {
            return Err(TransportError::Internal(format!(
                "endpoint size {epsize} leaves no room for report framing"
            )));
        }
        let api = HidApi::new()?;
        let device = api.open(vid, pid).map_err(|e| {
            TransportError::DeviceNotFound(format!("{vid:04x}:{pid:04x}: {e}"))
        })?;
        let product_name = device.get_product_string().ok().flatten();
        debug!(
            "opened raw HID device {:04x}:{:04x} (epsize {})",
            vid, pid, epsize
        );
        Ok(Self {
            device: Mutex::new(Some(device)),
            read_buf: Mutex::new(VecDeque::new()),
            read_failures: AtomicUsize::new(0),
            epsize,
            info: TransportInfo {
                kind: TransportKind::RawHid,
                vid,
                pid,
                path: format!("{vid:04x}:{pid:04x}"),
                product_name,
            },
        })
    }

    fn reopen(&self) -> Result<HidDevice, TransportError> {
        let api = HidApi::new()?;
        api.open(self.info.vid, self.info.pid)
            .map_err(|e| TransportError::ReopenFailed(e.to_string()))
    }

    /// Send one report: `[0x00 report-id][0xFA marker]<chunk>` padded to the
    /// full report size.
    fn send_report(&self, device: &HidDevice, chunk: &[u8]) -> Result<(), TransportError> {
        let mut report = vec![0u8; self.epsize + 1];
        report[0] = 0x00;
        report[1] = REPORT_MARKER;
        report[2..2 + chunk.len()].copy_from_slice(chunk);
        device.write(&report)?;
        Ok(())
    }
}

impl Transport for RawHidTransport {
    fn write(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let mut guard = self.device.lock();
        if guard.is_none() {
            // Torn down after sustained read failure; one lazy reopen
            debug!("raw HID handle closed, attempting reopen");
            *guard = Some(self.reopen()?);
            self.read_failures.store(0, Ordering::Relaxed);
        }
        let capacity = self.epsize - 2;
        let mut failure = None;
        if let Some(device) = guard.as_ref() {
            for chunk in bytes.chunks(capacity) {
                if let Err(e) = self.send_report(device, chunk) {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            warn!("raw HID write failed: {}", e);
            *guard = None;
            return Err(e);
        }
        Ok(bytes.len())
    }

    fn read_byte(&self) -> u8 {
        {
            let mut buf = self.read_buf.lock();
            if let Some(b) = buf.pop_front() {
                return b;
            }
        }

        let guard = self.device.lock();
        let Some(device) = guard.as_ref() else {
            return 0;
        };
        let mut report = vec![0u8; self.epsize];
        match device.read_timeout(&mut report, timing::READ_TIMEOUT_MS as i32) {
            Ok(0) => 0, // timeout, not an error
            Ok(len) => {
                self.read_failures.store(0, Ordering::Relaxed);
                if report[0] != REPORT_MARKER {
                    debug!("dropping report with unknown marker 0x{:02X}", report[0]);
                    return 0;
                }
                let mut buf = self.read_buf.lock();
                buf.extend(&report[1..len]);
                buf.pop_front().unwrap_or(0)
            }
            Err(e) => {
                let failures = self.read_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures > timing::MAX_READ_FAILURES {
                    warn!(
                        "raw HID read failed {} times ({}), tearing down handle",
                        failures, e
                    );
                    drop(guard);
                    self.device.lock().take();
                }
                0
            }
        }
    }

    fn close(&self) {
        // No buffers to flush; safe on an already closed handle.
        self.device.lock().take();
        self.read_buf.lock().clear();
    }

    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn max_message_len(&self) -> usize {
        self.epsize - 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undersized_endpoint_is_rejected_before_any_device_access() {
        for epsize in [0, 1, 2] {
            let err = RawHidTransport::open(0x1209, 0x6101, epsize).unwrap_err();
            assert!(
                matches!(err, TransportError::Internal(_)),
                "epsize {epsize} gave {err}"
            );
        }
    }
}
