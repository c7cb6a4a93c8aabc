//! Protocol constants for polykb keyboard communication
//!
//! Command ids ride inside framed messages (see [`crate::framing`]); they are
//! a single namespace shared by both directions, split into a host→device
//! range (0x10..) and a device→host range (0x40..).

/// Framed-message command ids
pub mod cmd {
    // Host → device (0x10 - 0x1F)

    /// Execute a CLI operation (memory/eeprom read/write, call)
    pub const CLI_EXEC: u8 = 0x10;
    /// One chunk of a dynamic payload upload
    pub const DYN_CHUNK: u8 = 0x11;
    /// Execute a previously uploaded dynamic function
    pub const EXEC_FUNC: u8 = 0x12;
    /// Request the current value of a structure
    pub const STRUCT_READ: u8 = 0x13;
    /// Write fields of a structure
    pub const STRUCT_WRITE: u8 = 0x14;
    /// Request the layout of a structure
    pub const STRUCT_QUERY_LAYOUT: u8 = 0x15;
    /// One chunk of an RGB pixel buffer (best-effort)
    pub const RGB_CHUNK: u8 = 0x16;
    /// Set the device mode scalar
    pub const SET_MODE: u8 = 0x17;
    /// Query the device mode scalar
    pub const GET_MODE: u8 = 0x18;

    // Device → host (0x40 - 0x4F)

    /// Structure layout announcement
    pub const STRUCT_LAYOUT: u8 = 0x40;
    /// Structure value message
    pub const STRUCT_VALUE: u8 = 0x41;
    /// CLI response (first payload byte echoes the CLI sequence)
    pub const CLI_RESPONSE: u8 = 0x42;
    /// Dynamic payload chunk acknowledgement
    pub const DYN_ACK: u8 = 0x43;
    /// Mode scalar report (single-character mode value)
    pub const MODE_STATE: u8 = 0x44;
    /// Key press/release publish event
    pub const KEY_EVENT: u8 = 0x45;
    /// Diagnostic publish (free-form, logged only)
    pub const DIAG: u8 = 0x46;
    /// Console text from the device firmware
    pub const CONSOLE: u8 = 0x47;
    /// Result of a dynamic function execution
    pub const EXEC_RESULT: u8 = 0x48;
    /// Structure write acknowledgement
    pub const STRUCT_WRITE_ACK: u8 = 0x49;

    /// Get human-readable name for a command id
    pub fn name(cmd: u8) -> &'static str {
        match cmd {
            CLI_EXEC => "CLI_EXEC",
            DYN_CHUNK => "DYN_CHUNK",
            EXEC_FUNC => "EXEC_FUNC",
            STRUCT_READ => "STRUCT_READ",
            STRUCT_WRITE => "STRUCT_WRITE",
            STRUCT_QUERY_LAYOUT => "STRUCT_QUERY_LAYOUT",
            RGB_CHUNK => "RGB_CHUNK",
            SET_MODE => "SET_MODE",
            GET_MODE => "GET_MODE",
            STRUCT_LAYOUT => "STRUCT_LAYOUT",
            STRUCT_VALUE => "STRUCT_VALUE",
            CLI_RESPONSE => "CLI_RESPONSE",
            DYN_ACK => "DYN_ACK",
            MODE_STATE => "MODE_STATE",
            KEY_EVENT => "KEY_EVENT",
            DIAG => "DIAG",
            CONSOLE => "CONSOLE",
            EXEC_RESULT => "EXEC_RESULT",
            STRUCT_WRITE_ACK => "STRUCT_WRITE_ACK",
            _ => "UNKNOWN",
        }
    }
}

/// CLI operation encoding (payload of [`cmd::CLI_EXEC`], after the CLI
/// sequence byte)
///
/// - memory read:  `[0x01][addr:4][size:1]`
/// - eeprom read:  `[0x02][addr:4][size:1]`
/// - write: same opcode with [`WRITE_FLAG`] set, followed by `[value:4]`
/// - call:         `[0x03][addr:4]`
/// - eeprom layout query: `[0x42]` (`EEPROM_READ | LAYOUT_FLAG`)
pub mod cli {
    /// RAM access opcode
    pub const MEM: u8 = 0x01;
    /// EEPROM access opcode
    pub const EEPROM: u8 = 0x02;
    /// Function call opcode
    pub const CALL: u8 = 0x03;
    /// High bit turns a read opcode into a write
    pub const WRITE_FLAG: u8 = 0x80;
    /// Flag turning an eeprom read into a layout query
    pub const LAYOUT_FLAG: u8 = 0x40;

    /// Encode a memory or eeprom read
    pub fn read(opcode: u8, addr: u32, size: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.push(opcode);
        out.extend_from_slice(&addr.to_le_bytes());
        out.push(size);
        out
    }

    /// Encode a memory or eeprom write
    pub fn write(opcode: u8, addr: u32, size: u8, value: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.push(opcode | WRITE_FLAG);
        out.extend_from_slice(&addr.to_le_bytes());
        out.push(size);
        out.extend_from_slice(&value.to_le_bytes());
        out
    }

    /// Encode a function call
    pub fn call(addr: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.push(CALL);
        out.extend_from_slice(&addr.to_le_bytes());
        out
    }

    /// Encode an eeprom layout query
    pub fn eeprom_layout() -> Vec<u8> {
        vec![EEPROM | LAYOUT_FLAG]
    }
}

/// Dynamic payload upload constants
pub mod dyn_payload {
    /// Chunk header length: `[dest_id:2][offset:2]`
    pub const HEADER_LEN: usize = 4;
    /// Sentinel offset of the terminal "commit" chunk
    pub const COMMIT_OFFSET: u16 = 0xFFFF;
    /// Ack status meaning the chunk was accepted
    pub const STATUS_OK: u8 = 0x00;
}

/// Communication timing constants
pub mod timing {
    /// Blocking read timeout on the transport (ms)
    pub const READ_TIMEOUT_MS: u64 = 20;
    /// Interval between correlator polls (device-time-units ≈ ms)
    pub const POLL_INTERVAL_MS: u64 = 2;
    /// Number of polls before a request times out
    pub const POLL_LIMIT: u32 = 100;
    /// Retries for plain send operations
    pub const SEND_RETRIES: usize = 3;
    /// Retries per chunk for acknowledged uploads
    pub const UPLOAD_RETRIES: usize = 10;
    /// Delay between best-effort RGB chunks (ms)
    pub const RGB_CHUNK_DELAY_MS: u64 = 5;
    /// Short delay between send retries (ms)
    pub const SHORT_DELAY_MS: u64 = 10;
    /// Consecutive raw-HID read failures before the handle is torn down
    pub const MAX_READ_FAILURES: usize = 10;
}
