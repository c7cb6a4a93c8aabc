//! Common types for the transport layer

/// Transport kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Classic serial line at a fixed baud rate
    Serial,
    /// Raw HID report channel
    RawHid,
}

/// Byte order of the device's microcontroller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Device identification information
#[derive(Debug, Clone)]
pub struct TransportInfo {
    /// Transport kind
    pub kind: TransportKind,
    /// USB Vendor ID (0 for serial ports)
    pub vid: u16,
    /// USB Product ID (0 for serial ports)
    pub pid: u16,
    /// Device path or identifier (transport-specific)
    pub path: String,
    /// Product name if available
    pub product_name: Option<String>,
}
