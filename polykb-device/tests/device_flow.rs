//! End-to-end device flows over a scripted in-memory transport.
//!
//! The mock implements the transport trait directly: outgoing wire bytes are
//! reassembled into frames and handed to a per-test handler, whose response
//! frames are queued for the reader loop to pick up byte by byte.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use polykb_device::{Device, DeviceConfig, DeviceError, StructValues, Value};
use polykb_transport::protocol::cmd;
use polykb_transport::{
    Frame, FrameCodec, FrameReader, RawCodec, SharedTransport, Transport, TransportError,
    TransportInfo, TransportKind,
};

type Handler = Box<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

struct ScriptedTransport {
    info: TransportInfo,
    codec: Arc<dyn FrameCodec>,
    outgoing: Mutex<FrameReader>,
    incoming: Mutex<VecDeque<u8>>,
    handler: Handler,
    frames_sent: AtomicUsize,
}

impl ScriptedTransport {
    fn new(handler: Handler) -> Arc<Self> {
        let codec: Arc<dyn FrameCodec> = Arc::new(RawCodec);
        Arc::new(Self {
            info: TransportInfo {
                kind: TransportKind::Serial,
                vid: 0,
                pid: 0,
                path: "mock".into(),
                product_name: Some("scripted".into()),
            },
            outgoing: Mutex::new(FrameReader::new(codec.start_byte(), 2048)),
            incoming: Mutex::new(VecDeque::new()),
            codec,
            handler,
            frames_sent: AtomicUsize::new(0),
        })
    }

    /// Queue a device-originated frame for the reader loop
    fn inject(&self, frame: Frame) {
        self.incoming.lock().extend(self.codec.encode(&frame));
    }
}

impl Transport for ScriptedTransport {
    fn write(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let mut reader = self.outgoing.lock();
        for &b in bytes {
            if let Some(body) = reader.push(b) {
                let frame = self
                    .codec
                    .decode_body(&body)
                    .map_err(|e| TransportError::Internal(e.to_string()))?;
                self.frames_sent.fetch_add(1, Ordering::SeqCst);
                for resp in (self.handler)(&frame) {
                    self.inject(resp);
                }
            }
        }
        Ok(bytes.len())
    }

    fn read_byte(&self) -> u8 {
        if let Some(b) = self.incoming.lock().pop_front() {
            return b;
        }
        std::thread::sleep(Duration::from_millis(1));
        0
    }

    fn close(&self) {}

    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn max_message_len(&self) -> usize {
        60
    }
}

fn fast_config() -> DeviceConfig {
    DeviceConfig {
        poll_interval: Duration::from_millis(1),
        poll_limit: 200,
        ..DeviceConfig::default()
    }
}

fn connect(transport: Arc<ScriptedTransport>, config: DeviceConfig) -> Device {
    let shared: SharedTransport = transport;
    Device::new(shared, Arc::new(RawCodec), config)
}

fn reply(command: u8, payload: Vec<u8>) -> Frame {
    Frame {
        command,
        seq: Some(0),
        payload,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn read_struct_fetches_layout_then_value() {
    // Structure 0x21: one u8 at bit 0, one u16 at bit 8
    let layout_payload = vec![
        0x01, 0x21, 0x03, 0x00, //
        0x01, 0x01, 0x00, 0x00, //
        0x02, 0x02, 0x08, 0x00, //
        0x00,
    ];
    let transport = ScriptedTransport::new(Box::new(move |frame| match frame.command {
        cmd::STRUCT_QUERY_LAYOUT => {
            assert_eq!(frame.payload, vec![0x21]);
            vec![reply(cmd::STRUCT_LAYOUT, layout_payload.clone())]
        }
        cmd::STRUCT_READ => {
            assert_eq!(frame.payload, vec![0x21]);
            vec![reply(cmd::STRUCT_VALUE, vec![0x21, 0x2A, 0x34, 0x12])]
        }
        other => panic!("unexpected command 0x{other:02X}"),
    }));
    let device = connect(transport, fast_config());

    let values = device.read_struct(0x21).await.unwrap();
    assert_eq!(values.get(&1), Some(&Value::Uint(0x2A)));
    assert_eq!(values.get(&2), Some(&Value::Uint(0x1234)));

    // The layout is cached: a second read skips the query
    let values = device.read_struct(0x21).await.unwrap();
    assert_eq!(values.get(&1), Some(&Value::Uint(0x2A)));
    assert!(device.snapshot(0x21).is_some());
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn write_struct_surfaces_nonzero_ack_status() {
    let layout_payload = vec![
        0x01, 0x30, 0x01, 0x00, //
        0x01, 0x01, 0x00, 0x00, //
        0x00,
    ];
    let transport = ScriptedTransport::new(Box::new(move |frame| match frame.command {
        cmd::STRUCT_QUERY_LAYOUT => vec![reply(cmd::STRUCT_LAYOUT, layout_payload.clone())],
        cmd::STRUCT_WRITE => {
            assert_eq!(frame.payload, vec![0x30, 0x55]);
            vec![reply(cmd::STRUCT_WRITE_ACK, vec![0x30, 0x07])]
        }
        other => panic!("unexpected command 0x{other:02X}"),
    }));
    let device = connect(transport, fast_config());

    let mut values = StructValues::new();
    values.insert(1, Value::Uint(0x55));
    let err = device.write_struct(0x30, &values).await.unwrap_err();
    assert!(matches!(err, DeviceError::CommandRejected { status: 0x07 }));
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_acks_every_chunk_and_commits() {
    let offsets = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&offsets);
    let transport = ScriptedTransport::new(Box::new(move |frame| {
        assert_eq!(frame.command, cmd::DYN_CHUNK);
        let p = &frame.payload;
        seen.lock().push(u16::from_le_bytes([p[2], p[3]]));
        // Echo the header back with an OK status
        vec![reply(cmd::DYN_ACK, vec![p[0], p[1], p[2], p[3], 0x00])]
    }));
    let device = connect(Arc::clone(&transport), fast_config());

    // 130 bytes at 56 net bytes per chunk: 3 data chunks plus commit
    device.upload_payload(5, &[0x11; 130]).await.unwrap();
    assert_eq!(*offsets.lock(), vec![0, 56, 112, 0xFFFF]);
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_aborts_before_commit_on_rejected_chunk() {
    let offsets = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&offsets);
    let transport = ScriptedTransport::new(Box::new(move |frame| {
        let p = &frame.payload;
        let offset = u16::from_le_bytes([p[2], p[3]]);
        seen.lock().push(offset);
        let status = if offset == 56 { 0x03 } else { 0x00 };
        vec![reply(cmd::DYN_ACK, vec![p[0], p[1], p[2], p[3], status])]
    }));
    let device = connect(transport, fast_config());

    let err = device.upload_payload(5, &[0x22; 130]).await.unwrap_err();
    assert!(matches!(err, DeviceError::Upload { status: 0x03 }));
    // The rejected chunk is not retried and the commit never goes out
    assert_eq!(*offsets.lock(), vec![0, 56]);
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_device_times_out_after_retries() {
    let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
    let config = DeviceConfig {
        poll_interval: Duration::from_millis(1),
        poll_limit: 5,
        request_retries: 2,
        ..DeviceConfig::default()
    };
    let device = connect(Arc::clone(&transport), config);

    let err = device.mem_read(0x2000_0000, 4).await.unwrap_err();
    assert!(matches!(err, DeviceError::Timeout));
    // One frame per retry went out
    assert_eq!(transport.frames_sent.load(Ordering::SeqCst), 2);
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn cli_memory_read_decodes_value() {
    let transport = ScriptedTransport::new(Box::new(|frame| {
        assert_eq!(frame.command, cmd::CLI_EXEC);
        let p = &frame.payload;
        let cli_seq = p[0];
        // [seq][opcode 0x01][addr:4 le][size]
        assert_eq!(p[1], 0x01);
        assert_eq!(&p[2..6], &0x2000_1000u32.to_le_bytes());
        assert_eq!(p[6], 4);
        vec![reply(
            cmd::CLI_RESPONSE,
            vec![cli_seq, 0xEF, 0xBE, 0xAD, 0xDE],
        )]
    }));
    let device = connect(transport, fast_config());

    let value = device.mem_read(0x2000_1000, 4).await.unwrap();
    assert_eq!(value, 0xDEAD_BEEF);
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn key_events_and_console_are_broadcast() {
    let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
    let device = connect(Arc::clone(&transport), fast_config());
    let mut keys = device.subscribe_key_events();
    let mut console = device.subscribe_console();

    transport.inject(reply(cmd::KEY_EVENT, vec![2, 5, 1, 0x10, 0x27, 0, 0]));
    transport.inject(reply(cmd::CONSOLE, b"boot ok\n".to_vec()));

    let event = tokio::time::timeout(Duration::from_secs(1), keys.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.row, 2);
    assert_eq!(event.col, 5);
    assert!(event.pressed);
    assert_eq!(event.time, 10_000);

    let line = tokio::time::timeout(Duration::from_secs(1), console.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "boot ok\n");
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn get_mode_correlates_mode_state() {
    let transport = ScriptedTransport::new(Box::new(|frame| match frame.command {
        cmd::GET_MODE => vec![reply(cmd::MODE_STATE, vec![b'N'])],
        other => panic!("unexpected command 0x{other:02X}"),
    }));
    let device = connect(transport, fast_config());

    assert_eq!(device.get_mode().await.unwrap(), b'N');
    assert_eq!(device.mode(), Some(b'N'));
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_polls_a_dead_transport_at_a_bounded_rate() {
    // A torn-down handle returns the 0 sentinel with no blocking read
    struct DeadTransport {
        info: TransportInfo,
        reads: AtomicUsize,
    }

    impl Transport for DeadTransport {
        fn write(&self, _bytes: &[u8]) -> Result<usize, TransportError> {
            Err(TransportError::Disconnected)
        }

        fn read_byte(&self) -> u8 {
            self.reads.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn close(&self) {}

        fn info(&self) -> &TransportInfo {
            &self.info
        }

        fn max_message_len(&self) -> usize {
            60
        }
    }

    let transport = Arc::new(DeadTransport {
        info: TransportInfo {
            kind: TransportKind::Serial,
            vid: 0,
            pid: 0,
            path: "dead".into(),
            product_name: None,
        },
        reads: AtomicUsize::new(0),
    });
    let shared: SharedTransport = Arc::clone(&transport) as SharedTransport;
    let device = Device::new(shared, Arc::new(RawCodec), fast_config());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reads = transport.reads.load(Ordering::SeqCst);
    // Paced at the poll interval, not a busy spin
    assert!(reads < 500, "reader loop spun {reads} times in 100ms");
    device.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_device_fails_requests_immediately() {
    let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
    let device = connect(transport, fast_config());
    device.close();

    let err = device.mem_read(0, 1).await.unwrap_err();
    assert!(matches!(err, DeviceError::Disconnected));
}
