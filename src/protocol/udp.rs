//! UDP datagram extraction.

use bytes::Bytes;

use crate::flow::FlowIdent;

/// One UDP datagram headed for the pseudo-stream aggregator.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub flow: FlowIdent,
    pub payload: Bytes,
    pub timestamp_us: i64,
}

impl UdpDatagram {
    pub fn new(flow: FlowIdent, payload: impl Into<Bytes>, timestamp_us: i64) -> Self {
        Self {
            flow,
            payload: payload.into(),
            timestamp_us,
        }
    }
}
