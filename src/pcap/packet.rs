//! Raw packet representation.

use bytes::Bytes;

/// Link type for Ethernet II frames.
pub const LINKTYPE_ETHERNET: u16 = 1;
/// Link type for raw IP packets (BSD value).
pub const LINKTYPE_RAW_BSD: u16 = 12;
/// Link type for raw IP packets.
pub const LINKTYPE_RAW: u16 = 101;
/// Raw IPv4.
pub const LINKTYPE_IPV4: u16 = 228;
/// Raw IPv6.
pub const LINKTYPE_IPV6: u16 = 229;

/// A captured packet as handed to the dispatcher.
///
/// The payload is immutable and cheaply cloneable, so mirroring a packet
/// to a side channel does not copy it.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Frame number (1-indexed).
    pub frame_number: u64,

    /// Timestamp in microseconds since epoch.
    pub timestamp_us: i64,

    /// Captured length (may be less than original).
    pub captured_length: u32,

    /// Original length on the wire.
    pub original_length: u32,

    /// Link layer type (e.g., 1 = Ethernet).
    pub link_type: u16,

    /// Raw packet data.
    pub data: Bytes,
}

impl RawPacket {
    pub fn new(
        frame_number: u64,
        timestamp_us: i64,
        original_length: u32,
        link_type: u16,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            frame_number,
            timestamp_us,
            captured_length: data.len() as u32,
            original_length,
            link_type,
            data,
        }
    }

    /// Ethernet frame captured in full.
    pub fn ethernet(frame_number: u64, timestamp_us: i64, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = data.len() as u32;
        Self::new(frame_number, timestamp_us, len, LINKTYPE_ETHERNET, data)
    }

    /// Check if the packet was truncated during capture.
    pub fn is_truncated(&self) -> bool {
        self.captured_length < self.original_length
    }
}
