use std::sync::Arc;

use crate::error::DecodeError;
use crate::stream::Conversation;

use super::{ConversationDecoder, DecodedRecord, StreamDecoder, TransportAffinity};

const HEADER_LEN: usize = 12;
/// Upper bound on compression pointer hops while reading a name.
const MAX_POINTER_HOPS: usize = 16;

/// DNS message headers and first question, one record per datagram.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsDecoder;

impl StreamDecoder for DnsDecoder {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn description(&self) -> &'static str {
        "DNS queries and responses over UDP"
    }

    fn transport(&self) -> TransportAffinity {
        TransportAffinity::Udp
    }

    fn ports(&self) -> &[u16] {
        &[53]
    }

    fn can_decode(&self, client: &[u8], _server: &[u8]) -> bool {
        // Query bit clear and exactly one question
        client.len() >= HEADER_LEN && client[2] & 0x80 == 0 && client[4..6] == [0, 1]
    }

    fn decoder(&self, conversation: Arc<Conversation>) -> Box<dyn ConversationDecoder> {
        Box::new(DnsConversation { conversation })
    }
}

struct DnsConversation {
    conversation: Arc<Conversation>,
}

#[derive(Debug, PartialEq, Eq)]
struct Message {
    id: u16,
    response: bool,
    opcode: u8,
    rcode: u8,
    questions: u16,
    answers: u16,
    question: Option<(String, u16)>,
}

fn parse_message(data: &[u8]) -> Option<Message> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    let flags = word(2);
    let questions = word(4);

    let question = if questions > 0 {
        let (name, end) = read_name(data, HEADER_LEN)?;
        let qtype = data.get(end..end + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))?;
        Some((name, qtype))
    } else {
        None
    };

    Some(Message {
        id: word(0),
        response: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0x0f) as u8,
        rcode: (flags & 0x000f) as u8,
        questions,
        answers: word(6),
        question,
    })
}

/// Read a possibly compressed name. Returns the dotted name and the offset
/// just past it in the original position.
fn read_name(data: &[u8], start: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos)? as usize;
        match len & 0xc0 {
            0x00 if len == 0 => {
                end.get_or_insert(pos + 1);
                break;
            }
            0x00 => {
                let label = data.get(pos + 1..pos + 1 + len)?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            0xc0 => {
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                let low = *data.get(pos + 1)? as usize;
                end.get_or_insert(pos + 2);
                pos = ((len & 0x3f) << 8) | low;
            }
            _ => return None,
        }
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        labels.join(".")
    };
    Some((name, end?))
}

fn qtype_name(qtype: u16) -> String {
    match qtype {
        1 => "A".into(),
        2 => "NS".into(),
        5 => "CNAME".into(),
        6 => "SOA".into(),
        12 => "PTR".into(),
        15 => "MX".into(),
        16 => "TXT".into(),
        28 => "AAAA".into(),
        33 => "SRV".into(),
        65 => "HTTPS".into(),
        255 => "ANY".into(),
        other => other.to_string(),
    }
}

impl ConversationDecoder for DnsConversation {
    fn decode(&mut self) -> Result<Vec<DecodedRecord>, DecodeError> {
        let mut records = Vec::new();
        let mut malformed = 0;

        for fragment in self.conversation.fragments() {
            let Some(message) = parse_message(fragment.data()) else {
                malformed += 1;
                continue;
            };
            let mut record = DecodedRecord::new(
                "dns",
                &self.conversation,
                fragment.direction(),
                fragment.timestamp_us(),
            )
            .with("id", message.id.to_string())
            .with("qr", if message.response { "response" } else { "query" })
            .with("opcode", message.opcode.to_string())
            .with("rcode", message.rcode.to_string())
            .with("questions", message.questions.to_string())
            .with("answers", message.answers.to_string());
            if let Some((name, qtype)) = message.question {
                record = record.with("qname", name).with("qtype", qtype_name(qtype));
            }
            records.push(record);
        }

        if records.is_empty() && malformed > 0 {
            return Err(DecodeError::Malformed {
                decoder: "dns",
                reason: format!("{malformed} datagrams without a valid header"),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowIdent, TransportProtocol};
    use crate::stream::DataFragment;
    use bytes::Bytes;

    /// Query for example.com A, id 0x1234.
    const QUERY: &[u8] = b"\x12\x34\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\
\x07example\x03com\x00\x00\x01\x00\x01";

    /// Response with the question repeated and one answer using a pointer.
    const RESPONSE: &[u8] = b"\x12\x34\x81\x80\x00\x01\x00\x01\x00\x00\x00\x00\
\x07example\x03com\x00\x00\x01\x00\x01\
\xc0\x0c\x00\x01\x00\x01\x00\x00\x0e\x10\x00\x04\x5d\xb8\xd8\x22";

    // Test 1: Header and question
    #[test]
    fn test_parse_query() {
        let message = parse_message(QUERY).unwrap();
        assert_eq!(message.id, 0x1234);
        assert!(!message.response);
        assert_eq!(message.question, Some(("example.com".to_string(), 1)));
    }

    // Test 2: Compression pointers resolve
    #[test]
    fn test_read_name_pointer() {
        let (name, end) = read_name(RESPONSE, 29).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(end, 31);
    }

    // Test 3: Pointer loops are refused
    #[test]
    fn test_pointer_loop() {
        let mut data = vec![0u8; 12];
        data.extend_from_slice(&[0xc0, 0x0c]);
        assert!(read_name(&data, 12).is_none());
    }

    // Test 4: Query/response pair
    #[test]
    fn test_decode_exchange() {
        let ident = FlowIdent::new(
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.53:53".parse().unwrap(),
        );
        let fragments = vec![
            DataFragment::new(Bytes::from_static(QUERY), Direction::ToServer, 1),
            DataFragment::new(Bytes::from_static(RESPONSE), Direction::ToClient, 2),
        ];
        let conv = Arc::new(Conversation::from_ordered(ident, TransportProtocol::Udp, fragments));
        assert!(DnsDecoder.can_decode(conv.first_client_fragment(), conv.first_server_fragment()));

        let records = DnsDecoder.decoder(conv).decode().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("qr"), Some("query"));
        assert_eq!(records[0].field("qname"), Some("example.com"));
        assert_eq!(records[0].field("qtype"), Some("A"));
        assert_eq!(records[1].field("qr"), Some("response"));
        assert_eq!(records[1].field("answers"), Some("1"));
        assert_eq!(records[1].direction, Direction::ToClient);
    }

    #[test]
    fn test_decode_garbage() {
        let ident = FlowIdent::new(
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.53:53".parse().unwrap(),
        );
        let fragments = vec![DataFragment::new(Bytes::from_static(b"\x01\x02"), Direction::ToServer, 1)];
        let conv = Arc::new(Conversation::from_ordered(ident, TransportProtocol::Udp, fragments));
        assert!(DnsDecoder.decoder(conv).decode().is_err());
    }
}
