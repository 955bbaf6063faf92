//! HTTP/1.x request and response summaries using httparse.
//!
//! Each direction is parsed as a sequence of messages. Bodies are skipped
//! using Content-Length or chunked framing; parsing stops at the first
//! message whose framing cannot be followed.

use std::sync::Arc;

use httparse::{Request, Response, Status, EMPTY_HEADER};

use crate::error::DecodeError;
use crate::flow::Direction;
use crate::stream::Conversation;

use super::{ConversationDecoder, DecodedRecord, DirectionalStream, StreamDecoder, TransportAffinity};

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 100;

const METHODS: [&[u8]; 9] = [
    b"GET ", b"POST ", b"HEAD ", b"PUT ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ", b"TRACE ",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDecoder;

impl StreamDecoder for HttpDecoder {
    fn name(&self) -> &'static str {
        "http"
    }

    fn description(&self) -> &'static str {
        "HTTP/1.x requests and responses"
    }

    fn transport(&self) -> TransportAffinity {
        TransportAffinity::Tcp
    }

    fn ports(&self) -> &[u16] {
        &[80, 8080, 8000]
    }

    fn can_decode(&self, client: &[u8], server: &[u8]) -> bool {
        METHODS.iter().any(|m| client.starts_with(m)) || server.starts_with(b"HTTP/1.")
    }

    fn decoder(&self, conversation: Arc<Conversation>) -> Box<dyn ConversationDecoder> {
        Box::new(HttpConversation { conversation })
    }
}

struct HttpConversation {
    conversation: Arc<Conversation>,
}

/// Relevant headers, lowercased name to record field.
fn header_field(name: &str) -> Option<&'static str> {
    Some(match name {
        "host" => "host",
        "user-agent" => "user_agent",
        "content-type" => "content_type",
        "content-length" => "content_length",
        "server" => "server",
        "location" => "location",
        "referer" | "referrer" => "referer",
        "transfer-encoding" => "transfer_encoding",
        _ => return None,
    })
}

/// How a message body is delimited.
enum Body {
    Length(usize),
    Chunked,
    /// Runs to the end of the stream.
    Unbounded,
}

fn framing(headers: &[httparse::Header<'_>], is_request: bool) -> Body {
    let mut body = if is_request {
        Body::Length(0)
    } else {
        Body::Unbounded
    };
    for header in headers.iter().filter(|h| !h.name.is_empty()) {
        if header.name.eq_ignore_ascii_case("transfer-encoding")
            && String::from_utf8_lossy(header.value)
                .to_ascii_lowercase()
                .contains("chunked")
        {
            return Body::Chunked;
        }
        if header.name.eq_ignore_ascii_case("content-length") {
            if let Some(len) = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
            {
                body = Body::Length(len);
            }
        }
    }
    body
}

/// Length of a chunked body at the start of `data`, if complete.
fn chunked_len(data: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        let line_end = data[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| pos + p)?;
        let size_str = std::str::from_utf8(&data[pos..line_end]).ok()?;
        let size_part = size_str.split(';').next().unwrap_or(size_str);
        let chunk_size = usize::from_str_radix(size_part.trim(), 16).ok()?;
        pos = line_end + 2;

        if chunk_size == 0 {
            if data.get(pos..pos + 2) == Some(&b"\r\n"[..]) {
                return Some(pos + 2);
            }
            // Trailers
            return data[pos..]
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|end| pos + end + 4);
        }
        // Sizes come from the wire; a huge one must fail, not wrap.
        let end = pos.checked_add(chunk_size)?;
        let after = end.checked_add(2)?;
        if data.get(end..after) != Some(&b"\r\n"[..]) {
            return None;
        }
        pos = after;
    }
}

fn skip_body(body: Body, rest: &[u8]) -> Option<usize> {
    match body {
        Body::Length(len) => (len <= rest.len()).then_some(len),
        Body::Chunked => chunked_len(rest),
        Body::Unbounded => None,
    }
}

impl HttpConversation {
    fn requests(&self, out: &mut Vec<DecodedRecord>) -> Result<(), DecodeError> {
        let stream = DirectionalStream::new(&self.conversation, Direction::ToServer);
        let mut pos = 0;
        while pos < stream.data.len() {
            let mut headers = [EMPTY_HEADER; MAX_HEADERS];
            let mut req = Request::new(&mut headers);
            let header_len = match req.parse(&stream.data[pos..]) {
                Ok(Status::Complete(len)) => len,
                Ok(Status::Partial) => break,
                Err(e) => return malformed(out, e),
            };

            let mut record = DecodedRecord::new(
                "http",
                &self.conversation,
                Direction::ToServer,
                stream.timestamp_at(pos),
            )
            .with("method", req.method.unwrap_or_default())
            .with("uri", req.path.unwrap_or_default())
            .with("version", format!("HTTP/1.{}", req.version.unwrap_or(1)));
            record = with_headers(record, &*req.headers);
            out.push(record);

            let body = framing(&*req.headers, true);
            let start = pos + header_len;
            match skip_body(body, &stream.data[start..]) {
                Some(len) => pos = start + len,
                None => break,
            }
        }
        Ok(())
    }

    fn responses(&self, out: &mut Vec<DecodedRecord>) -> Result<(), DecodeError> {
        let stream = DirectionalStream::new(&self.conversation, Direction::ToClient);
        let mut pos = 0;
        while pos < stream.data.len() {
            let mut headers = [EMPTY_HEADER; MAX_HEADERS];
            let mut resp = Response::new(&mut headers);
            let header_len = match resp.parse(&stream.data[pos..]) {
                Ok(Status::Complete(len)) => len,
                Ok(Status::Partial) => break,
                Err(e) => return malformed(out, e),
            };

            let mut record = DecodedRecord::new(
                "http",
                &self.conversation,
                Direction::ToClient,
                stream.timestamp_at(pos),
            )
            .with("status", resp.code.unwrap_or_default().to_string())
            .with("reason", resp.reason.unwrap_or_default())
            .with("version", format!("HTTP/1.{}", resp.version.unwrap_or(1)));
            record = with_headers(record, &*resp.headers);
            out.push(record);

            let body = framing(&*resp.headers, false);
            let start = pos + header_len;
            match skip_body(body, &stream.data[start..]) {
                Some(len) => pos = start + len,
                None => break,
            }
        }
        Ok(())
    }
}

fn with_headers(mut record: DecodedRecord, headers: &[httparse::Header<'_>]) -> DecodedRecord {
    for header in headers.iter().filter(|h| !h.name.is_empty()) {
        if let Some(field) = header_field(&header.name.to_ascii_lowercase()) {
            record = record.with(field, String::from_utf8_lossy(header.value));
        }
    }
    record
}

/// A parse error after earlier messages decoded fine just ends that
/// direction.
fn malformed(out: &[DecodedRecord], e: httparse::Error) -> Result<(), DecodeError> {
    if out.is_empty() {
        Err(DecodeError::Malformed {
            decoder: "http",
            reason: e.to_string(),
        })
    } else {
        Ok(())
    }
}

impl ConversationDecoder for HttpConversation {
    fn decode(&mut self) -> Result<Vec<DecodedRecord>, DecodeError> {
        let mut records = Vec::new();
        self.requests(&mut records)?;
        self.responses(&mut records)?;
        records.sort_by_key(|r| r.timestamp_us);
        Ok(records)
    }
}
