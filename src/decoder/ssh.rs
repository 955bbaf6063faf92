use std::sync::Arc;

use crate::error::DecodeError;
use crate::flow::Direction;
use crate::stream::Conversation;

use super::{lines, ConversationDecoder, DecodedRecord, DirectionalStream, StreamDecoder, TransportAffinity};

/// SSH identification strings (`SSH-protoversion-softwareversion comments`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SshDecoder;

impl StreamDecoder for SshDecoder {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn description(&self) -> &'static str {
        "SSH protocol and software versions"
    }

    fn transport(&self) -> TransportAffinity {
        TransportAffinity::Tcp
    }

    fn ports(&self) -> &[u16] {
        &[22]
    }

    fn can_decode(&self, client: &[u8], server: &[u8]) -> bool {
        client.starts_with(b"SSH-") || server.starts_with(b"SSH-")
    }

    fn decoder(&self, conversation: Arc<Conversation>) -> Box<dyn ConversationDecoder> {
        Box::new(SshConversation { conversation })
    }
}

struct SshConversation {
    conversation: Arc<Conversation>,
}

impl SshConversation {
    /// The identification line may be preceded by other lines (RFC 4253
    /// section 4.2), so scan the first few.
    fn identify(&self, direction: Direction) -> Result<Option<DecodedRecord>, DecodeError> {
        let stream = DirectionalStream::new(&self.conversation, direction);
        let Some((offset, line)) = lines(&stream.data)
            .take(8)
            .find(|(_, l)| l.starts_with(b"SSH-"))
        else {
            return Ok(None);
        };

        let line = String::from_utf8_lossy(line);
        let (ident, comments) = match line.split_once(' ') {
            Some((ident, comments)) => (ident, Some(comments)),
            None => (&*line, None),
        };
        let mut parts = ident.splitn(3, '-').skip(1);
        let (Some(version), Some(software)) = (parts.next(), parts.next()) else {
            return Err(DecodeError::Malformed {
                decoder: "ssh",
                reason: format!("bad identification string '{ident}'"),
            });
        };

        let mut record = DecodedRecord::new(
            "ssh",
            &self.conversation,
            direction,
            stream.timestamp_at(offset),
        )
        .with("ident", &*line)
        .with("proto_version", version)
        .with("software", software);
        if let Some(comments) = comments {
            record = record.with("comments", comments);
        }
        Ok(Some(record))
    }
}

impl ConversationDecoder for SshConversation {
    fn decode(&mut self) -> Result<Vec<DecodedRecord>, DecodeError> {
        let mut records = Vec::with_capacity(2);
        for direction in [Direction::ToServer, Direction::ToClient] {
            if let Some(record) = self.identify(direction)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
