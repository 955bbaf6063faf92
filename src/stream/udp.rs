use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::context::PipelineContext;
use crate::decoder::decode_conversation;
use crate::flow::{Direction, FlowIdent, FlowKey, TransportProtocol};
use crate::protocol::UdpDatagram;
use crate::stats::ReassemblyStats;

use super::processor::process_all;
use super::{Conversation, DataFragment};

#[derive(Debug, Clone)]
struct Datagram {
    flow: FlowIdent,
    payload: Bytes,
    timestamp_us: i64,
}

/// Arrival-ordered datagrams of one UDP flow.
#[derive(Debug, Clone)]
pub struct UdpStream {
    datagrams: Vec<Datagram>,
    last_seen_us: i64,
}

impl UdpStream {
    fn new() -> Self {
        Self {
            datagrams: Vec::new(),
            last_seen_us: i64::MIN,
        }
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    /// Sort by capture time, take the sender of the earliest datagram as
    /// the client and tag every datagram relative to it.
    pub fn into_conversation(mut self) -> Option<Conversation> {
        self.datagrams.sort_by_key(|d| d.timestamp_us);
        let client = self.datagrams.first()?.flow;
        let fragments = self
            .datagrams
            .into_iter()
            .map(|d| {
                let direction = if d.flow == client {
                    Direction::ToServer
                } else {
                    Direction::ToClient
                };
                DataFragment::new(d.payload, direction, d.timestamp_us)
            })
            .collect();
        Some(Conversation::from_ordered(client, TransportProtocol::Udp, fragments))
    }
}

/// UDP pseudo-streams keyed by their order-independent flow key.
///
/// Each stream is removed from the pool before it is processed, so it is
/// decoded and saved exactly once.
pub struct UdpStreamPool {
    ctx: Arc<PipelineContext>,
    streams: Mutex<HashMap<FlowKey, UdpStream>>,
}

impl UdpStreamPool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, datagram: &UdpDatagram) {
        if datagram.payload.is_empty() {
            return;
        }
        let key = datagram.flow.key(TransportProtocol::Udp);
        let mut streams = self.streams.lock();
        let stream = streams.entry(key).or_insert_with(UdpStream::new);
        stream.last_seen_us = stream.last_seen_us.max(datagram.timestamp_us);
        stream.datagrams.push(Datagram {
            flow: datagram.flow,
            payload: datagram.payload.clone(),
            timestamp_us: datagram.timestamp_us,
        });
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Process streams idle since before `cutoff` on the calling thread.
    pub fn flush_older_than(&self, cutoff: i64) -> usize {
        let stale: Vec<UdpStream> = {
            let mut streams = self.streams.lock();
            let keys: Vec<FlowKey> = streams
                .iter()
                .filter(|(_, s)| s.last_seen_us < cutoff)
                .map(|(k, _)| *k)
                .collect();
            keys.iter().filter_map(|k| streams.remove(k)).collect()
        };
        let count = stale.len();
        for stream in stale {
            self.save_stream(stream);
        }
        if count > 0 {
            tracing::debug!(count, "flushed idle udp streams");
        }
        count
    }

    /// Process every remaining stream on the bounded stream worker pool.
    pub fn flush(&self) -> usize {
        let streams: Vec<UdpStream> = self.streams.lock().drain().map(|(_, s)| s).collect();
        let config = &self.ctx.config;
        process_all(
            config.num_stream_workers,
            config.stream_processor_buffer,
            "udp",
            streams,
            |stream| self.save_stream(stream),
        )
    }

    fn save_stream(&self, stream: UdpStream) {
        let Some(conversation) = stream.into_conversation() else {
            return;
        };
        let conversation = Arc::new(conversation);
        let ctx = &self.ctx;

        if ctx.config.save_conversations {
            match ctx.writer.save_conversation(&conversation) {
                Ok(()) => ReassemblyStats::incr(&ctx.stats.saved_udp_connections),
                Err(e) => {
                    tracing::warn!(ident = %conversation.ident(), error = %e, "failed to save udp stream");
                    ctx.record_error(&e.to_string());
                }
            }
        }

        let banner = server_banner(&conversation, ctx.config.banner_size);
        if !banner.is_empty() {
            ctx.services.identify(
                &banner,
                conversation.ident(),
                conversation.first_packet().unwrap_or_default(),
                TransportProtocol::Udp,
            );
        }
        decode_conversation(ctx, conversation);
    }
}

fn server_banner(conversation: &Conversation, limit: usize) -> Vec<u8> {
    let mut banner = Vec::new();
    for fragment in conversation
        .fragments()
        .iter()
        .filter(|f| f.direction() == Direction::ToClient)
    {
        let room = limit - banner.len();
        if room == 0 {
            break;
        }
        banner.extend_from_slice(&fragment.data()[..room.min(fragment.len())]);
    }
    banner
}
