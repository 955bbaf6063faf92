//! Hand-built capture frames shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pcapstream::config::PipelineConfig;
use pcapstream::context::PipelineContext;
use pcapstream::pcap::RawPacket;
use pcapstream::pipeline::Pipeline;
use pcapstream::writer::MemoryWriter;

pub const FIN: u8 = 0x01;
pub const SYN: u8 = 0x02;
pub const RST: u8 = 0x04;
pub const PSH: u8 = 0x08;
pub const ACK: u8 = 0x10;

pub const CLIENT: [u8; 4] = [10, 0, 0, 1];
pub const SERVER: [u8; 4] = [10, 0, 0, 2];

/// Build an Ethernet/IPv4 frame around a transport header and payload.
fn ipv4_frame(src: [u8; 4], dst: [u8; 4], protocol: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::new();

    // Ethernet header (14 bytes)
    packet.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // dst MAC
    packet.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]); // src MAC
    packet.extend_from_slice(&[0x08, 0x00]); // ethertype: IPv4

    // IPv4 header (20 bytes)
    packet.push(0x45); // Version 4, IHL 5
    packet.push(0x00); // DSCP + ECN
    packet.extend_from_slice(&((20 + body.len()) as u16).to_be_bytes()); // Total length
    packet.extend_from_slice(&[0x00, 0x01]); // Identification
    packet.extend_from_slice(&[0x40, 0x00]); // Don't fragment
    packet.push(0x40); // TTL: 64
    packet.push(protocol);
    packet.extend_from_slice(&[0x00, 0x00]); // Checksum
    packet.extend_from_slice(&src);
    packet.extend_from_slice(&dst);

    packet.extend_from_slice(body);
    packet
}

/// Build a complete Ethernet/IPv4/TCP frame.
pub fn tcp_frame(
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut tcp = Vec::new();
    tcp.extend_from_slice(&sport.to_be_bytes());
    tcp.extend_from_slice(&dport.to_be_bytes());
    tcp.extend_from_slice(&seq.to_be_bytes());
    tcp.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // Ack
    tcp.push(0x50); // Data offset: 5 (20 bytes)
    tcp.push(flags);
    tcp.extend_from_slice(&[0xff, 0xff]); // Window: 65535
    tcp.extend_from_slice(&[0x00, 0x00]); // Checksum
    tcp.extend_from_slice(&[0x00, 0x00]); // Urgent pointer
    tcp.extend_from_slice(payload);
    ipv4_frame(src, dst, 6, &tcp)
}

/// Build a complete Ethernet/IPv4/UDP frame.
pub fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut udp = Vec::new();
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0x00, 0x00]); // Checksum (unused)
    udp.extend_from_slice(payload);
    ipv4_frame(src, dst, 17, &udp)
}

/// Packets numbered in the order they are added.
#[derive(Default)]
pub struct Capture {
    pub packets: Vec<RawPacket>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, timestamp_us: i64, frame: Vec<u8>) {
        let number = self.packets.len() as u64 + 1;
        self.packets.push(RawPacket::ethernet(number, timestamp_us, frame));
    }

    pub fn tcp(
        &mut self,
        ts: i64,
        src: ([u8; 4], u16),
        dst: ([u8; 4], u16),
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) -> &mut Self {
        self.push(ts, tcp_frame(src.0, dst.0, src.1, dst.1, seq, flags, payload));
        self
    }

    pub fn udp(&mut self, ts: i64, src: ([u8; 4], u16), dst: ([u8; 4], u16), payload: &[u8]) -> &mut Self {
        self.push(ts, udp_frame(src.0, dst.0, src.1, dst.1, payload));
        self
    }

    pub fn submit_all(&self, pipeline: &Pipeline) {
        for packet in &self.packets {
            pipeline.submit(packet.clone()).unwrap();
        }
    }
}

/// Pipeline over an in-memory writer.
pub fn memory_pipeline(config: PipelineConfig) -> (Pipeline, Arc<MemoryWriter>) {
    let writer = Arc::new(MemoryWriter::new());
    let ctx = PipelineContext::builder(config)
        .writer(writer.clone())
        .build()
        .unwrap();
    (Pipeline::new(ctx).unwrap(), writer)
}

pub fn single_worker() -> PipelineConfig {
    PipelineConfig {
        workers: 1,
        ..Default::default()
    }
}
