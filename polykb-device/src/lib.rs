//! High-level device interface for polykb keyboards
//!
//! This crate provides the framed request/response protocol on top of any
//! byte transport: a single reader loop classifies inbound frames (struct
//! layouts and values, CLI responses, upload acks, key-press publishes,
//! console text) and the [`Device`] handle exposes the corresponding
//! operations — schema-driven struct reads/writes, CLI memory access,
//! reliable chunked payload upload, best-effort RGB streaming.

pub mod correlator;
pub mod error;
pub mod schema;
pub mod uploader;

pub use correlator::{PendingTable, RequestKey};
pub use error::DeviceError;
pub use schema::{
    decode_struct, encode_struct, FieldDef, FieldType, SchemaError, StructLayout, StructValues,
    Value,
};
pub use uploader::{build_chunks, Chunk};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use polykb_transport::protocol::{cli, cmd, dyn_payload, timing};
use polykb_transport::{
    Endianness, Frame, FrameCodec, FrameReader, SharedTransport, TransportError,
};

/// Broadcast channel capacity for publish events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on a collected frame body; larger bodies are line noise
const MAX_FRAME_BODY: usize = 2048;

/// A decoded key press/release publish event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub row: u8,
    pub col: u8,
    /// Device timestamp in device time units
    pub time: u32,
    pub pressed: bool,
}

impl KeyEvent {
    /// Parse a `KEY_EVENT` frame payload: `[row][col][pressed][time:4]`
    pub fn parse(payload: &[u8], endian: Endianness) -> Option<Self> {
        if payload.len() < 7 {
            return None;
        }
        let t = [payload[3], payload[4], payload[5], payload[6]];
        let time = match endian {
            Endianness::Little => u32::from_le_bytes(t),
            Endianness::Big => u32::from_be_bytes(t),
        };
        Some(Self {
            row: payload[0],
            col: payload[1],
            pressed: payload[2] != 0,
            time,
        })
    }
}

/// Per-connection configuration knobs
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Byte order of the device's microcontroller
    pub endianness: Endianness,
    /// Maximum frame payload size accepted by the device
    pub max_payload: usize,
    /// Interval between correlator polls
    pub poll_interval: Duration,
    /// Number of polls before a request times out
    pub poll_limit: u32,
    /// Full request retries after a timeout
    pub request_retries: usize,
    /// Per-chunk retries during acknowledged uploads
    pub upload_retries: usize,
    /// Pause between best-effort RGB chunks
    pub rgb_chunk_delay: Duration,
    /// Transport write retries
    pub send_retries: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            endianness: Endianness::Little,
            max_payload: 60,
            poll_interval: Duration::from_millis(timing::POLL_INTERVAL_MS),
            poll_limit: timing::POLL_LIMIT,
            request_retries: timing::SEND_RETRIES,
            upload_retries: timing::UPLOAD_RETRIES,
            rgb_chunk_delay: Duration::from_millis(timing::RGB_CHUNK_DELAY_MS),
            send_retries: timing::SEND_RETRIES,
        }
    }
}

/// Inbound frame classifier, run on the reader thread.
///
/// Dispatch is synchronous and must not block: it only fills tables and
/// broadcast channels shared with the correlating callers.
struct Dispatcher {
    endianness: Endianness,
    pending: Arc<PendingTable>,
    layouts: Arc<Mutex<HashMap<u8, StructLayout>>>,
    snapshots: Arc<Mutex<HashMap<u8, StructValues>>>,
    mode: Arc<Mutex<Option<u8>>>,
    key_tx: broadcast::Sender<KeyEvent>,
    console_tx: broadcast::Sender<String>,
}

impl Dispatcher {
    fn dispatch(&self, frame: Frame) {
        let payload = &frame.payload;
        match frame.command {
            cmd::STRUCT_LAYOUT => match StructLayout::parse(payload) {
                Ok(layout) => {
                    let id = layout.struct_id;
                    debug!(
                        "layout for structure 0x{:02X}: {} fields",
                        id,
                        layout.fields.len()
                    );
                    self.layouts.lock().insert(id, layout);
                    self.pending.fulfill(RequestKey::StructLayout(id), payload.clone());
                }
                Err(e) => warn!("dropping malformed layout: {e}"),
            },
            cmd::STRUCT_VALUE => {
                let Some(&id) = payload.first() else {
                    warn!("dropping empty struct value message");
                    return;
                };
                let layout = self.layouts.lock().get(&id).cloned();
                match layout {
                    Some(layout) => match decode_struct(&layout, payload, self.endianness) {
                        Ok(values) => {
                            self.snapshots.lock().insert(id, values);
                        }
                        Err(e) => warn!("structure 0x{id:02X}: {e}"),
                    },
                    None => warn!("value for unknown structure 0x{id:02X}, skipped"),
                }
                self.pending.fulfill(RequestKey::StructValue(id), payload.clone());
            }
            cmd::CLI_RESPONSE => {
                let Some(&seq) = payload.first() else {
                    return;
                };
                if !self.pending.fulfill(RequestKey::Cli(seq), payload[1..].to_vec()) {
                    debug!("unmatched CLI response, seq {seq}");
                }
            }
            cmd::DYN_ACK => {
                if payload.len() < dyn_payload::HEADER_LEN {
                    warn!("dropping short upload ack ({} bytes)", payload.len());
                    return;
                }
                let dest = match self.endianness {
                    Endianness::Little => u16::from_le_bytes([payload[0], payload[1]]),
                    Endianness::Big => u16::from_be_bytes([payload[0], payload[1]]),
                };
                if !self.pending.fulfill(RequestKey::Upload(dest), payload.clone()) {
                    debug!("unmatched upload ack for destination {dest}");
                }
            }
            cmd::EXEC_RESULT => {
                let Some(&seq) = payload.first() else {
                    return;
                };
                if !self.pending.fulfill(RequestKey::Exec(seq), payload[1..].to_vec()) {
                    debug!("unmatched exec result, seq {seq}");
                }
            }
            cmd::STRUCT_WRITE_ACK => {
                let Some(&id) = payload.first() else {
                    return;
                };
                self.pending.fulfill(RequestKey::WriteAck(id), payload.clone());
            }
            cmd::MODE_STATE => {
                if let Some(&mode) = payload.first() {
                    *self.mode.lock() = Some(mode);
                    self.pending.fulfill(RequestKey::Mode, payload.clone());
                }
            }
            cmd::KEY_EVENT => match KeyEvent::parse(payload, self.endianness) {
                Some(event) => {
                    let _ = self.key_tx.send(event);
                }
                None => warn!("dropping short key event ({} bytes)", payload.len()),
            },
            cmd::CONSOLE => {
                let text = String::from_utf8_lossy(payload).into_owned();
                let _ = self.console_tx.send(text);
            }
            cmd::DIAG => {
                debug!("device diagnostic: {:02X?}", payload);
            }
            other => {
                warn!("unhandled command 0x{:02X} ({})", other, cmd::name(other));
            }
        }
    }
}

/// Handle to one physical keyboard.
///
/// Exclusively owns its transport and reader loop; created on connect,
/// destroyed on disconnect. All request/response waits must run on a thread
/// other than the reader (any tokio worker qualifies; the reader is a
/// dedicated OS thread).
pub struct Device {
    transport: SharedTransport,
    codec: Arc<dyn FrameCodec>,
    config: DeviceConfig,
    /// Effective frame payload bound after transport clamping
    max_payload: usize,
    seq: AtomicU8,
    cli_seq: AtomicU8,
    exec_seq: AtomicU8,
    pending: Arc<PendingTable>,
    layouts: Arc<Mutex<HashMap<u8, StructLayout>>>,
    snapshots: Arc<Mutex<HashMap<u8, StructValues>>>,
    mode: Arc<Mutex<Option<u8>>>,
    key_tx: broadcast::Sender<KeyEvent>,
    console_tx: broadcast::Sender<String>,
    shutdown: Arc<AtomicBool>,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Device {
    /// Create a device handle and start its reader loop.
    ///
    /// The frame codec is chosen once here; see
    /// [`polykb_transport::framing`] for the two modes.
    pub fn new(
        transport: SharedTransport,
        codec: Arc<dyn FrameCodec>,
        config: DeviceConfig,
    ) -> Self {
        let max_payload = config.max_payload.min(transport.max_message_len());
        let pending = Arc::new(PendingTable::new());
        let layouts = Arc::new(Mutex::new(HashMap::new()));
        let snapshots = Arc::new(Mutex::new(HashMap::new()));
        let mode = Arc::new(Mutex::new(None));
        let (key_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (console_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher {
            endianness: config.endianness,
            pending: Arc::clone(&pending),
            layouts: Arc::clone(&layouts),
            snapshots: Arc::clone(&snapshots),
            mode: Arc::clone(&mode),
            key_tx: key_tx.clone(),
            console_tx: console_tx.clone(),
        };
        let reader_transport = Arc::clone(&transport);
        let reader_codec = Arc::clone(&codec);
        let reader_shutdown = Arc::clone(&shutdown);
        let reader = std::thread::spawn(move || {
            run_reader_loop(reader_transport, reader_codec, dispatcher, reader_shutdown);
        });

        Self {
            transport,
            codec,
            config,
            max_payload,
            seq: AtomicU8::new(0),
            cli_seq: AtomicU8::new(0),
            exec_seq: AtomicU8::new(0),
            pending,
            layouts,
            snapshots,
            mode,
            key_tx,
            console_tx,
            shutdown,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Effective frame payload bound for this connection
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Subscribe to key press/release publish events
    pub fn subscribe_key_events(&self) -> broadcast::Receiver<KeyEvent> {
        self.key_tx.subscribe()
    }

    /// Subscribe to console text from the device firmware
    pub fn subscribe_console(&self) -> broadcast::Receiver<String> {
        self.console_tx.subscribe()
    }

    /// Latest decoded snapshot for a structure, if any value message arrived
    pub fn snapshot(&self, struct_id: u8) -> Option<StructValues> {
        self.snapshots.lock().get(&struct_id).cloned()
    }

    /// Cached layout for a structure
    pub fn layout(&self, struct_id: u8) -> Option<StructLayout> {
        self.layouts.lock().get(&struct_id).cloned()
    }

    /// Last reported mode scalar
    pub fn mode(&self) -> Option<u8> {
        *self.mode.lock()
    }

    // === Frame plumbing ===

    fn next_seq(&self) -> Option<u8> {
        self.codec
            .uses_sequence_numbers()
            .then(|| self.seq.fetch_add(1, Ordering::Relaxed))
    }

    async fn send_frame(&self, command: u8, payload: Vec<u8>) -> Result<(), DeviceError> {
        if self.pending.is_disconnected() {
            return Err(DeviceError::Disconnected);
        }
        if payload.len() > self.max_payload {
            return Err(DeviceError::Transport(TransportError::MessageTooLarge {
                len: payload.len(),
                max: self.max_payload,
            }));
        }
        let frame = Frame {
            command,
            seq: self.next_seq(),
            payload,
        };
        let wire = self.codec.encode(&frame);
        debug!(
            "sending {} seq {:?} ({} payload bytes)",
            cmd::name(command),
            frame.seq,
            frame.payload.len()
        );
        let mut last = None;
        for attempt in 0..self.config.send_retries {
            match self.transport.write(&wire) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!("send attempt {attempt} failed: {e}");
                    last = Some(e);
                    tokio::time::sleep(Duration::from_millis(timing::SHORT_DELAY_MS)).await;
                }
            }
        }
        Err(DeviceError::Transport(
            last.unwrap_or(TransportError::Disconnected),
        ))
    }

    /// Send a frame and wait for the response registered under `key`,
    /// retrying the whole exchange a bounded number of times.
    async fn request(
        &self,
        key: RequestKey,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, DeviceError> {
        let mut last = DeviceError::Timeout;
        for attempt in 0..self.config.request_retries {
            self.pending.register(key);
            if let Err(e) = self.send_frame(command, payload.clone()).await {
                self.pending.cancel(key);
                return Err(e);
            }
            match self
                .pending
                .wait(key, self.config.poll_interval, self.config.poll_limit)
                .await
            {
                Ok(data) => return Ok(data),
                Err(DeviceError::Disconnected) => return Err(DeviceError::Disconnected),
                Err(e) => {
                    debug!("{} attempt {attempt} got no response", cmd::name(command));
                    last = e;
                }
            }
        }
        Err(last)
    }

    // === Struct operations ===

    /// Ensure the layout for `struct_id` is cached, querying the device on a
    /// cache miss.
    pub async fn ensure_layout(&self, struct_id: u8) -> Result<StructLayout, DeviceError> {
        if let Some(layout) = self.layout(struct_id) {
            return Ok(layout);
        }
        self.request(
            RequestKey::StructLayout(struct_id),
            cmd::STRUCT_QUERY_LAYOUT,
            vec![struct_id],
        )
        .await?;
        self.layout(struct_id)
            .ok_or(DeviceError::Schema(SchemaError::UnknownStruct(struct_id)))
    }

    /// Read the current value of a structure, fetching its layout first if
    /// needed.
    pub async fn read_struct(&self, struct_id: u8) -> Result<StructValues, DeviceError> {
        let layout = self.ensure_layout(struct_id).await?;
        let payload = self
            .request(
                RequestKey::StructValue(struct_id),
                cmd::STRUCT_READ,
                vec![struct_id],
            )
            .await?;
        Ok(decode_struct(&layout, &payload, self.config.endianness)?)
    }

    /// Write fields of a structure and wait for the device acknowledgement
    pub async fn write_struct(
        &self,
        struct_id: u8,
        values: &StructValues,
    ) -> Result<(), DeviceError> {
        let layout = self.ensure_layout(struct_id).await?;
        let field_bytes = encode_struct(
            &layout,
            values,
            self.config.endianness,
            self.max_payload.saturating_sub(schema::FIELD_BASE),
        )?;
        let mut payload = Vec::with_capacity(field_bytes.len() + 1);
        payload.push(struct_id);
        payload.extend_from_slice(&field_bytes);
        let ack = self
            .request(RequestKey::WriteAck(struct_id), cmd::STRUCT_WRITE, payload)
            .await?;
        match ack.get(1) {
            Some(0) | None => Ok(()),
            Some(&status) => Err(DeviceError::CommandRejected { status }),
        }
    }

    // === CLI operations ===

    async fn cli_request(&self, op: Vec<u8>) -> Result<Vec<u8>, DeviceError> {
        let seq = self.cli_seq.fetch_add(1, Ordering::Relaxed);
        let mut payload = Vec::with_capacity(op.len() + 1);
        payload.push(seq);
        payload.extend_from_slice(&op);
        self.request(RequestKey::Cli(seq), cmd::CLI_EXEC, payload).await
    }

    fn check_read_size(size: u8) -> Result<(), DeviceError> {
        if size == 0 || size > 4 {
            return Err(DeviceError::InvalidParameter(format!(
                "read size must be 1-4 bytes, got {size}"
            )));
        }
        Ok(())
    }

    fn uint_from(&self, bytes: &[u8]) -> u32 {
        let mut v = 0u32;
        match self.config.endianness {
            Endianness::Little => {
                for &b in bytes.iter().rev() {
                    v = (v << 8) | b as u32;
                }
            }
            Endianness::Big => {
                for &b in bytes {
                    v = (v << 8) | b as u32;
                }
            }
        }
        v
    }

    /// Read `size` bytes (1-4) of device RAM at `addr`
    pub async fn mem_read(&self, addr: u32, size: u8) -> Result<u32, DeviceError> {
        Self::check_read_size(size)?;
        let data = self.cli_request(cli::read(cli::MEM, addr, size)).await?;
        Ok(self.uint_from(&data[..(size as usize).min(data.len())]))
    }

    /// Write `size` bytes (1-4) of device RAM at `addr`
    pub async fn mem_write(&self, addr: u32, size: u8, value: u32) -> Result<(), DeviceError> {
        Self::check_read_size(size)?;
        let data = self.cli_request(cli::write(cli::MEM, addr, size, value)).await?;
        match data.first() {
            Some(0) | None => Ok(()),
            Some(&status) => Err(DeviceError::CommandRejected { status }),
        }
    }

    /// Read `size` bytes (1-4) of device EEPROM at `addr`
    pub async fn eeprom_read(&self, addr: u32, size: u8) -> Result<u32, DeviceError> {
        Self::check_read_size(size)?;
        let data = self.cli_request(cli::read(cli::EEPROM, addr, size)).await?;
        Ok(self.uint_from(&data[..(size as usize).min(data.len())]))
    }

    /// Write `size` bytes (1-4) of device EEPROM at `addr`
    pub async fn eeprom_write(&self, addr: u32, size: u8, value: u32) -> Result<(), DeviceError> {
        Self::check_read_size(size)?;
        let data = self
            .cli_request(cli::write(cli::EEPROM, addr, size, value))
            .await?;
        match data.first() {
            Some(0) | None => Ok(()),
            Some(&status) => Err(DeviceError::CommandRejected { status }),
        }
    }

    /// Call a function at `addr` on the device; returns the raw result bytes
    pub async fn call(&self, addr: u32) -> Result<Vec<u8>, DeviceError> {
        self.cli_request(cli::call(addr)).await
    }

    /// Query the EEPROM layout: `(start address, size)`
    pub async fn eeprom_layout(&self) -> Result<(u32, u32), DeviceError> {
        let data = self.cli_request(cli::eeprom_layout()).await?;
        if data.len() < 8 {
            return Err(DeviceError::InvalidParameter(format!(
                "short eeprom layout response ({} bytes)",
                data.len()
            )));
        }
        Ok((self.uint_from(&data[0..4]), self.uint_from(&data[4..8])))
    }

    // === Dynamic payload operations ===

    /// Upload `payload` to destination `dest_id` in acknowledged chunks and
    /// commit it.
    ///
    /// Each chunk is sent and waited on before the next; a nonzero ack
    /// status aborts the whole upload without sending the terminal commit
    /// chunk. Timed-out chunks are retried up to the configured bound.
    pub async fn upload_payload(&self, dest_id: u16, payload: &[u8]) -> Result<(), DeviceError> {
        if payload.len() >= dyn_payload::COMMIT_OFFSET as usize {
            return Err(DeviceError::InvalidParameter(format!(
                "payload of {} bytes cannot be addressed with 16-bit offsets",
                payload.len()
            )));
        }
        let chunks = build_chunks(dest_id, payload, self.max_payload);
        for chunk in &chunks {
            self.send_chunk_acked(chunk).await?;
        }
        Ok(())
    }

    async fn send_chunk_acked(&self, chunk: &Chunk) -> Result<(), DeviceError> {
        let payload = chunk.to_payload(self.config.endianness);
        for attempt in 0..self.config.upload_retries {
            self.pending.register(RequestKey::Upload(chunk.dest_id));
            if let Err(e) = self.send_frame(cmd::DYN_CHUNK, payload.clone()).await {
                self.pending.cancel(RequestKey::Upload(chunk.dest_id));
                return Err(e);
            }
            match self
                .pending
                .wait(
                    RequestKey::Upload(chunk.dest_id),
                    self.config.poll_interval,
                    self.config.poll_limit,
                )
                .await
            {
                Ok(ack) => {
                    let status = ack
                        .get(dyn_payload::HEADER_LEN)
                        .copied()
                        .unwrap_or(dyn_payload::STATUS_OK);
                    if status != dyn_payload::STATUS_OK {
                        return Err(DeviceError::Upload { status });
                    }
                    return Ok(());
                }
                Err(DeviceError::Disconnected) => return Err(DeviceError::Disconnected),
                Err(_) => {
                    debug!(
                        "chunk at offset 0x{:04X} attempt {attempt} got no ack",
                        chunk.offset
                    );
                }
            }
        }
        Err(DeviceError::Timeout)
    }

    /// Stream an RGB pixel buffer to destination `dest_id`, best-effort.
    ///
    /// Chunks are unacknowledged and rate-limited; only transport failures
    /// surface.
    pub async fn stream_rgb(&self, dest_id: u16, pixels: &[u8]) -> Result<(), DeviceError> {
        let chunks = build_chunks(dest_id, pixels, self.max_payload);
        for chunk in &chunks {
            self.send_frame(cmd::RGB_CHUNK, chunk.to_payload(self.config.endianness))
                .await?;
            tokio::time::sleep(self.config.rgb_chunk_delay).await;
        }
        Ok(())
    }

    /// Execute a previously uploaded dynamic function
    pub async fn exec_function(&self, dest_id: u16) -> Result<Vec<u8>, DeviceError> {
        let seq = self.exec_seq.fetch_add(1, Ordering::Relaxed);
        let dest = match self.config.endianness {
            Endianness::Little => dest_id.to_le_bytes(),
            Endianness::Big => dest_id.to_be_bytes(),
        };
        let payload = vec![seq, dest[0], dest[1]];
        let data = self
            .request(RequestKey::Exec(seq), cmd::EXEC_FUNC, payload)
            .await?;
        match data.first() {
            Some(0) | None => Ok(data),
            Some(&status) => Err(DeviceError::CommandRejected { status }),
        }
    }

    // === Mode scalar ===

    /// Set the device mode scalar, fire-and-forget
    pub async fn set_mode(&self, mode: u8) -> Result<(), DeviceError> {
        self.send_frame(cmd::SET_MODE, vec![mode]).await
    }

    /// Query the device mode scalar
    pub async fn get_mode(&self) -> Result<u8, DeviceError> {
        let data = self.request(RequestKey::Mode, cmd::GET_MODE, Vec::new()).await?;
        data.first()
            .copied()
            .ok_or_else(|| DeviceError::InvalidParameter("empty mode response".into()))
    }

    /// Close the handle: stop the reader loop, fail all pending requests
    /// with `Disconnected`, and release the transport. Idempotent.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pending.fail_all();
        self.layouts.lock().clear();
        self.snapshots.lock().clear();
        self.transport.close();
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pending.fail_all();
    }
}

/// Single reader loop per device handle: drains the transport one byte at a
/// time, reassembles frames and dispatches them synchronously.
fn run_reader_loop(
    transport: SharedTransport,
    codec: Arc<dyn FrameCodec>,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
) {
    debug!("device reader loop started");
    let mut reader = FrameReader::new(codec.start_byte(), MAX_FRAME_BODY);
    while !shutdown.load(Ordering::Relaxed) {
        let byte = transport.read_byte();
        if byte == 0 && !reader.in_frame() {
            // Timeout sentinel between frames, or a torn-down handle that
            // returns immediately; pace the poll either way
            std::thread::sleep(Duration::from_millis(timing::POLL_INTERVAL_MS));
            continue;
        }
        if let Some(body) = reader.push(byte) {
            match codec.decode_body(&body) {
                Ok(frame) => dispatcher.dispatch(frame),
                Err(e) => warn!("dropping malformed frame: {e}"),
            }
        }
    }
    debug!("device reader loop exiting");
}
