//! TCP segment extraction.

use bytes::Bytes;
use etherparse::{TcpOptionElement, TcpSlice};

use crate::flow::FlowIdent;

/// Control flags relevant to reassembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub const SYN: Self = Self::with(true, false, false, false);
    pub const SYN_ACK: Self = Self::with(true, true, false, false);
    pub const ACK: Self = Self::with(false, true, false, false);
    pub const FIN_ACK: Self = Self::with(false, true, true, false);
    pub const RST: Self = Self::with(false, false, false, true);

    const fn with(syn: bool, ack: bool, fin: bool, rst: bool) -> Self {
        Self {
            syn,
            ack,
            fin,
            rst,
            psh: false,
        }
    }
}

/// Options consulted by the option checker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    /// An option could not be decoded (bad length or truncated).
    pub malformed: bool,
}

/// One TCP segment as seen by the reassembly engine.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub flow: FlowIdent,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub options: TcpOptions,
    /// `None` when checksum validation was not requested.
    pub checksum_valid: Option<bool>,
    pub payload: Bytes,
    pub timestamp_us: i64,
}

impl TcpSegment {
    /// Segment with default window and no options.
    pub fn new(
        flow: FlowIdent,
        seq: u32,
        flags: TcpFlags,
        payload: impl Into<Bytes>,
        timestamp_us: i64,
    ) -> Self {
        Self {
            flow,
            seq,
            ack: 0,
            flags,
            window: u16::MAX,
            options: TcpOptions::default(),
            checksum_valid: None,
            payload: payload.into(),
            timestamp_us,
        }
    }

    pub fn with_ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self.flags.ack = true;
        self
    }

    /// Sequence space consumed: payload plus one for SYN and FIN each.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.flags.syn) + u32::from(self.flags.fin)
    }
}

pub(crate) fn flags_of(tcp: &TcpSlice<'_>) -> TcpFlags {
    TcpFlags {
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        psh: tcp.psh(),
    }
}

pub(crate) fn options_of(tcp: &TcpSlice<'_>) -> TcpOptions {
    let mut options = TcpOptions::default();
    for element in tcp.options_iterator() {
        match element {
            Ok(TcpOptionElement::MaximumSegmentSize(mss)) => options.mss = Some(mss),
            Ok(TcpOptionElement::WindowScale(scale)) => options.window_scale = Some(scale),
            Ok(_) => {}
            Err(_) => {
                options.malformed = true;
                break;
            }
        }
    }
    options
}
