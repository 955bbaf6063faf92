//! Races between the two halves of a connection and across workers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use bytes::Bytes;
use common::*;
use pcapstream::config::PipelineConfig;
use pcapstream::context::PipelineContext;
use pcapstream::decoder::{ConversationDecoder, DecodedRecord, DecoderRegistry, StreamDecoder, TransportAffinity};
use pcapstream::error::DecodeError;
use pcapstream::flow::FlowIdent;
use pcapstream::pcap::RawPacket;
use pcapstream::stream::{
    Completion, CompletionReason, ConnectionFactory, Conversation, Delivery, DeliveryStats, FlowDirection,
    ReassemblyStream, Skip,
};
use pcapstream::writer::MemoryWriter;

/// Counts how many conversations it was asked to decode.
struct CountingDecoder {
    built: Arc<AtomicUsize>,
}

struct NoRecords;

impl ConversationDecoder for NoRecords {
    fn decode(&mut self) -> Result<Vec<DecodedRecord>, DecodeError> {
        Ok(Vec::new())
    }
}

impl StreamDecoder for CountingDecoder {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn description(&self) -> &'static str {
        "counts decoded conversations"
    }

    fn transport(&self) -> TransportAffinity {
        TransportAffinity::Tcp
    }

    fn can_decode(&self, _client: &[u8], _server: &[u8]) -> bool {
        true
    }

    fn decoder(&self, _conversation: Arc<Conversation>) -> Box<dyn ConversationDecoder> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Box::new(NoRecords)
    }
}

fn completion(direction: FlowDirection, flow: FlowIdent) -> Completion {
    Completion {
        direction,
        reason: CompletionReason::Fin,
        earliest_timestamp_us: 1,
        earliest_flow: flow,
    }
}

// Test 1: Both halves completing at once decode the conversation exactly once
#[test]
fn test_completion_race_decodes_once() {
    const ITERATIONS: usize = 10_000;

    let built = Arc::new(AtomicUsize::new(0));
    let mut registry = DecoderRegistry::new();
    registry.register(Arc::new(CountingDecoder {
        built: Arc::clone(&built),
    }));
    let writer = Arc::new(MemoryWriter::new());
    let ctx = PipelineContext::builder(PipelineConfig::default())
        .registry(registry)
        .writer(writer.clone())
        .build()
        .unwrap();
    let factory = ConnectionFactory::new(Arc::clone(&ctx));
    let payload = Bytes::from_static(b"ping");

    for i in 0..ITERATIONS {
        let port = 1024 + (i % 60_000) as u16;
        let flow = FlowIdent::new(
            format!("10.0.0.1:{port}").parse().unwrap(),
            "10.0.0.2:7000".parse().unwrap(),
        );
        let conn = factory.create(flow, 1);
        conn.deliver(&Delivery {
            direction: FlowDirection::Forward,
            data: &payload[..],
            skip: Skip::None,
            timestamp_us: 1,
            start: true,
            end: false,
            stats: DeliveryStats::default(),
        });

        let barrier = Barrier::new(2);
        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = [FlowDirection::Forward, FlowDirection::Reverse]
                .into_iter()
                .map(|direction| {
                    let conn = &conn;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        conn.complete(&completion(direction, flow))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(|&forget| forget));
        assert_eq!(built.load(Ordering::SeqCst), i + 1, "iteration {i}");
        assert!(conn.is_saved());
        factory.prune();
    }

    assert_eq!(writer.conversations().len(), ITERATIONS);
    assert_eq!(ctx.stats.snapshot().saved_tcp_connections, ITERATIONS as u64);
    assert_eq!(factory.connection_count(), 0);
}

// Test 2: Round-robin keeps per-worker counts within one of each other
#[test]
fn test_dispatch_fairness() {
    const PACKETS: u64 = 1003;

    let (pipeline, _writer) = memory_pipeline(PipelineConfig {
        workers: 4,
        ..Default::default()
    });
    for i in 0..PACKETS {
        let frame = udp_frame(CLIENT, SERVER, 40000 + (i % 16) as u16, 9999, b"x");
        pipeline
            .submit(RawPacket::ethernet(i + 1, i as i64, frame))
            .unwrap();
    }
    let summary = pipeline.drain();

    let counts = &summary.worker_packets;
    assert_eq!(counts.len(), 4);
    assert_eq!(counts.iter().sum::<u64>(), PACKETS);
    let max = counts.iter().max().copied().unwrap_or_default();
    let min = counts.iter().min().copied().unwrap_or_default();
    assert!(max - min <= 1, "unbalanced: {counts:?}");
    assert_eq!(summary.stats.saved_udp_connections, 16);
}

// Test 3: Concurrent submitters from several threads lose nothing
#[test]
fn test_concurrent_submitters() {
    let (pipeline, writer) = memory_pipeline(PipelineConfig {
        workers: 3,
        ..Default::default()
    });
    thread::scope(|scope| {
        for t in 0..4u16 {
            let pipeline = &pipeline;
            scope.spawn(move || {
                for i in 0..50i64 {
                    let frame = udp_frame(CLIENT, SERVER, 41000 + t, 5000, b"data");
                    pipeline
                        .submit(RawPacket::ethernet(i as u64, i, frame))
                        .unwrap();
                }
            });
        }
    });
    let summary = pipeline.drain();

    assert_eq!(summary.worker_packets.iter().sum::<u64>(), 200);
    assert_eq!(writer.conversations().len(), 4);
    for conv in writer.conversations() {
        assert_eq!(conv.fragments().len(), 50);
    }
}

// Test 4: Tens of thousands of open connections drain on a fixed set of threads
#[test]
fn test_many_open_connections() {
    const CONNECTIONS: u32 = 20_000;

    let (pipeline, writer) = memory_pipeline(PipelineConfig {
        workers: 1,
        reader_threads: 2,
        ..Default::default()
    });
    for i in 0..CONNECTIONS {
        let client = ([10, 1, (i >> 8) as u8, i as u8], 40000);
        let server = (SERVER, 9999);
        let syn = tcp_frame(client.0, server.0, client.1, server.1, 1, SYN, b"");
        let data = tcp_frame(client.0, server.0, client.1, server.1, 2, PSH | ACK, b"x");
        let number = u64::from(i) * 2;
        pipeline
            .submit(RawPacket::ethernet(number + 1, i64::from(i), syn))
            .unwrap();
        pipeline
            .submit(RawPacket::ethernet(number + 2, i64::from(i), data))
            .unwrap();
    }
    let summary = pipeline.drain();

    assert_eq!(summary.stats.saved_tcp_connections, u64::from(CONNECTIONS));
    assert_eq!(writer.conversations().len(), CONNECTIONS as usize);
    assert!(summary.errors.is_empty(), "errors: {:?}", summary.errors);
}
