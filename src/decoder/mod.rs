//! Application decoders for merged conversations.
//!
//! A [`StreamDecoder`] describes one protocol: which transport it runs
//! over, which server ports it is registered for and a sniff predicate on
//! the leading bytes of each direction. The [`DecoderRegistry`] picks at
//! most one decoder per conversation; the chosen descriptor then builds a
//! [`ConversationDecoder`] bound to that conversation, which runs once.

mod dns;
mod http;
mod pop3;
mod registry;
mod ssh;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{DecodeError, SetupError};
use crate::flow::{Direction, TransportProtocol};
use crate::stream::Conversation;

pub use dns::DnsDecoder;
pub use http::HttpDecoder;
pub use pop3::Pop3Decoder;
pub use registry::{decode_conversation, DecoderRegistry};
pub use ssh::SshDecoder;

/// Transports a decoder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAffinity {
    Tcp,
    Udp,
    All,
}

impl TransportAffinity {
    pub fn accepts(&self, transport: TransportProtocol) -> bool {
        matches!(
            (self, transport),
            (TransportAffinity::All, _)
                | (TransportAffinity::Tcp, TransportProtocol::Tcp)
                | (TransportAffinity::Udp, TransportProtocol::Udp)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportAffinity::Tcp => "tcp",
            TransportAffinity::Udp => "udp",
            TransportAffinity::All => "tcp+udp",
        }
    }
}

/// Descriptor of one application decoder. Registered at startup and
/// read-only afterwards.
pub trait StreamDecoder: Send + Sync {
    /// Protocol identifier (e.g., "http", "ssh").
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn transport(&self) -> TransportAffinity;

    /// Server ports this decoder is registered for.
    fn ports(&self) -> &[u16] {
        &[]
    }

    /// Called once before any packet is processed.
    fn init(&self) -> Result<(), SetupError> {
        Ok(())
    }

    /// Called once after the pipeline drained.
    fn finish(&self) {}

    /// Sniff predicate on the first fragment of each direction. Either
    /// slice may be empty.
    fn can_decode(&self, client: &[u8], server: &[u8]) -> bool;

    /// Build a decoder bound to one conversation.
    fn decoder(&self, conversation: Arc<Conversation>) -> Box<dyn ConversationDecoder>;
}

/// Decoder instance for a single conversation.
pub trait ConversationDecoder: Send {
    fn decode(&mut self) -> Result<Vec<DecodedRecord>, DecodeError>;
}

/// One decoded application-layer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedRecord {
    pub decoder: &'static str,
    pub flow: String,
    pub transport: TransportProtocol,
    pub timestamp_us: i64,
    pub direction: Direction,
    pub fields: BTreeMap<&'static str, String>,
}

impl DecodedRecord {
    pub fn new(
        decoder: &'static str,
        conversation: &Conversation,
        direction: Direction,
        timestamp_us: i64,
    ) -> Self {
        Self {
            decoder,
            flow: conversation.ident().to_string(),
            transport: conversation.transport(),
            timestamp_us,
            direction,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.insert(key, value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Every decoder shipped with the crate, in registration order.
pub fn builtin_decoders() -> Vec<Arc<dyn StreamDecoder>> {
    vec![
        Arc::new(HttpDecoder),
        Arc::new(Pop3Decoder),
        Arc::new(SshDecoder),
        Arc::new(DnsDecoder),
    ]
}

/// One direction of a conversation flattened into a single buffer, with
/// the capture time of every fragment boundary.
pub(crate) struct DirectionalStream {
    pub data: Vec<u8>,
    marks: Vec<(usize, i64)>,
}

impl DirectionalStream {
    pub fn new(conversation: &Conversation, direction: Direction) -> Self {
        let mut data = Vec::new();
        let mut marks = Vec::new();
        for fragment in conversation
            .fragments()
            .iter()
            .filter(|f| f.direction() == direction)
        {
            marks.push((data.len(), fragment.timestamp_us()));
            data.extend_from_slice(fragment.data());
        }
        Self { data, marks }
    }

    /// Capture time of the fragment holding byte `offset`.
    pub fn timestamp_at(&self, offset: usize) -> i64 {
        let index = self.marks.partition_point(|&(start, _)| start <= offset);
        self.marks
            .get(index.saturating_sub(1))
            .map(|&(_, ts)| ts)
            .unwrap_or_default()
    }
}

/// Non-empty CRLF- or LF-terminated lines with their start offsets. A
/// trailing partial line is returned as well.
pub(crate) fn lines(data: &[u8]) -> impl Iterator<Item = (usize, &[u8])> {
    let mut offset = 0;
    data.split(|&b| b == b'\n').filter_map(move |raw| {
        let start = offset;
        offset += raw.len() + 1;
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);
        (!line.is_empty()).then_some((start, line))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity() {
        assert!(TransportAffinity::All.accepts(TransportProtocol::Udp));
        assert!(TransportAffinity::Tcp.accepts(TransportProtocol::Tcp));
        assert!(!TransportAffinity::Tcp.accepts(TransportProtocol::Udp));
        assert!(!TransportAffinity::Udp.accepts(TransportProtocol::Tcp));
    }

    #[test]
    fn test_timestamp_at() {
        use crate::flow::FlowIdent;
        use crate::stream::DataFragment;
        use bytes::Bytes;

        let ident = FlowIdent::new(
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:2".parse().unwrap(),
        );
        let client = vec![
            DataFragment::new(Bytes::from_static(b"abc"), Direction::ToServer, 10),
            DataFragment::new(Bytes::from_static(b"de"), Direction::ToServer, 20),
        ];
        let conv = Conversation::merge(ident, TransportProtocol::Tcp, &client, &[]);
        let stream = DirectionalStream::new(&conv, Direction::ToServer);
        assert_eq!(stream.data, b"abcde");
        assert_eq!(stream.timestamp_at(0), 10);
        assert_eq!(stream.timestamp_at(2), 10);
        assert_eq!(stream.timestamp_at(3), 20);
        assert_eq!(stream.timestamp_at(99), 20);
    }

    #[test]
    fn test_lines() {
        let got: Vec<(usize, String)> = lines(b"USER bob\r\nPASS x\npartial")
            .map(|(offset, line)| (offset, String::from_utf8_lossy(line).into_owned()))
            .collect();
        assert_eq!(
            got,
            vec![
                (0, "USER bob".to_string()),
                (10, "PASS x".to_string()),
                (17, "partial".to_string()),
            ]
        );
    }

    #[test]
    fn test_builtin_names_unique() {
        let decoders = builtin_decoders();
        let mut names: Vec<_> = decoders.iter().map(|d| d.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), decoders.len());
    }
}
