//! Request/response correlation
//!
//! Outstanding requests are keyed in one shared table; the reader loop fills
//! slots as responses arrive and callers poll their own slot at a fixed short
//! interval from a thread other than the reader. The key spaces of the
//! logical channels (CLI sequence, function exec, uploads, struct traffic,
//! mode) are disjoint so concurrent channels cannot cross-match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::DeviceError;

/// Key of one outstanding request.
///
/// Each variant is its own key space (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKey {
    /// CLI-local sequence number
    Cli(u8),
    /// Function-exec-local sequence number
    Exec(u8),
    /// Chunked upload, keyed by destination id
    Upload(u16),
    /// Layout announcement for a structure id
    StructLayout(u8),
    /// Value message for a structure id
    StructValue(u8),
    /// Write acknowledgement for a structure id
    WriteAck(u8),
    /// Mode scalar report
    Mode,
}

/// Table of pending requests shared between the reader loop and callers
pub struct PendingTable {
    slots: Mutex<HashMap<RequestKey, Option<Vec<u8>>>>,
    disconnected: AtomicBool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Register an outstanding request before sending it. Clears any stale
    /// slot under the same key.
    pub fn register(&self, key: RequestKey) {
        self.slots.lock().insert(key, None);
    }

    /// Remove a request that will no longer be awaited
    pub fn cancel(&self, key: RequestKey) {
        self.slots.lock().remove(&key);
    }

    /// Fill the slot for `key` if anyone is waiting on it. Returns whether a
    /// waiter existed; unmatched responses are the caller's to log.
    pub fn fulfill(&self, key: RequestKey, data: Vec<u8>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&key) {
            Some(slot) => {
                *slot = Some(data);
                true
            }
            None => false,
        }
    }

    /// Bounded sleep-and-poll for the response to `key`.
    ///
    /// Polls every `poll_interval` up to `poll_limit` times. Must run off
    /// the reader thread. Fails fast with `Disconnected` once the table has
    /// been failed.
    pub async fn wait(
        &self,
        key: RequestKey,
        poll_interval: Duration,
        poll_limit: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        for _ in 0..poll_limit {
            {
                let mut slots = self.slots.lock();
                if matches!(slots.get(&key), Some(Some(_))) {
                    if let Some(Some(data)) = slots.remove(&key) {
                        return Ok(data);
                    }
                }
            }
            if self.disconnected.load(Ordering::Acquire) {
                self.cancel(key);
                return Err(DeviceError::Disconnected);
            }
            tokio::time::sleep(poll_interval).await;
        }
        debug!("request {:?} timed out after {} polls", key, poll_limit);
        self.cancel(key);
        Err(DeviceError::Timeout)
    }

    /// Fail every pending and future wait with `Disconnected`. Called when
    /// the device handle closes so waiters do not time out silently.
    pub fn fail_all(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.slots.lock().clear();
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
