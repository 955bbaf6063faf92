use std::sync::Arc;

use crate::error::DecodeError;
use crate::flow::Direction;
use crate::stream::Conversation;

use super::{lines, ConversationDecoder, DecodedRecord, DirectionalStream, StreamDecoder, TransportAffinity};

const COMMANDS: [&str; 14] = [
    "USER", "PASS", "APOP", "AUTH", "CAPA", "STAT", "LIST", "RETR", "DELE", "NOOP", "RSET", "TOP", "UIDL",
    "QUIT",
];

/// POP3 command and status log. Credentials are never recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pop3Decoder;

impl StreamDecoder for Pop3Decoder {
    fn name(&self) -> &'static str {
        "pop3"
    }

    fn description(&self) -> &'static str {
        "POP3 commands and status replies"
    }

    fn transport(&self) -> TransportAffinity {
        TransportAffinity::Tcp
    }

    fn ports(&self) -> &[u16] {
        &[110]
    }

    fn can_decode(&self, _client: &[u8], server: &[u8]) -> bool {
        server.starts_with(b"+OK")
    }

    fn decoder(&self, conversation: Arc<Conversation>) -> Box<dyn ConversationDecoder> {
        Box::new(Pop3Conversation { conversation })
    }
}

struct Pop3Conversation {
    conversation: Arc<Conversation>,
}

impl Pop3Conversation {
    fn commands(&self, out: &mut Vec<DecodedRecord>) {
        let stream = DirectionalStream::new(&self.conversation, Direction::ToServer);
        for (offset, line) in lines(&stream.data) {
            let line = String::from_utf8_lossy(line);
            let (verb, argument) = line.split_once(' ').unwrap_or((&*line, ""));
            let verb = verb.to_ascii_uppercase();
            if !COMMANDS.contains(&verb.as_str()) {
                continue;
            }
            let argument = match verb.as_str() {
                "PASS" => "<elided>",
                "APOP" => argument.split_whitespace().next().unwrap_or_default(),
                _ => argument,
            };
            let mut record = DecodedRecord::new(
                "pop3",
                &self.conversation,
                Direction::ToServer,
                stream.timestamp_at(offset),
            )
            .with("command", verb.as_str());
            if !argument.is_empty() {
                record = record.with("argument", argument);
            }
            out.push(record);
        }
    }

    /// Only status lines; multi-line payloads (RETR, LIST) are skipped.
    fn replies(&self, out: &mut Vec<DecodedRecord>) -> Result<(), DecodeError> {
        let stream = DirectionalStream::new(&self.conversation, Direction::ToClient);
        let mut seen = false;
        for (offset, line) in lines(&stream.data) {
            let status = if line.starts_with(b"+OK") {
                "+OK"
            } else if line.starts_with(b"-ERR") {
                "-ERR"
            } else {
                if !seen {
                    return Err(DecodeError::Malformed {
                        decoder: "pop3",
                        reason: "server did not open with a status line".into(),
                    });
                }
                continue;
            };
            seen = true;
            let message = String::from_utf8_lossy(&line[status.len()..]);
            out.push(
                DecodedRecord::new(
                    "pop3",
                    &self.conversation,
                    Direction::ToClient,
                    stream.timestamp_at(offset),
                )
                .with("status", status)
                .with("message", message.trim()),
            );
        }
        Ok(())
    }
}

impl ConversationDecoder for Pop3Conversation {
    fn decode(&mut self) -> Result<Vec<DecodedRecord>, DecodeError> {
        let mut records = Vec::new();
        self.replies(&mut records)?;
        self.commands(&mut records);
        records.sort_by_key(|r| r.timestamp_us);
        Ok(records)
    }
}
