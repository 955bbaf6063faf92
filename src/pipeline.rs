//! The packet-to-conversation pipeline and its shutdown drain.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;

use crate::context::PipelineContext;
use crate::dispatch::Dispatcher;
use crate::error::PipelineError;
use crate::pcap::RawPacket;
use crate::stats::StatsSnapshot;
use crate::stream::{process_all, ConnectionFactory, TcpConnection, UdpStreamPool};

/// Counters readable while running and after drain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub stats: StatsSnapshot,
    /// Packets seen per layer, most frequent first.
    pub protocols: Vec<(String, u64)>,
    pub errors: Vec<(String, u64)>,
    pub services: usize,
    /// Records written per decoder.
    pub decoders: Vec<(&'static str, u64)>,
    /// Packets accepted per dispatcher worker.
    pub worker_packets: Vec<u64>,
    /// TCP connections persisted by the drain pool.
    pub drained_connections: usize,
    /// UDP pseudo-streams persisted at drain.
    pub drained_udp_streams: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stats)?;
        writeln!(f, "{:<28} {:>14}", "services", self.services)?;
        writeln!(f, "{:<28} {:>14}", "drained TCP connections", self.drained_connections)?;
        writeln!(f, "{:<28} {:>14}", "drained UDP streams", self.drained_udp_streams)?;

        if !self.protocols.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<28} {:>14}", "Layer", "Packets")?;
            writeln!(f, "{:-<43}", "")?;
            for (name, count) in &self.protocols {
                writeln!(f, "{name:<28} {count:>14}")?;
            }
        }
        if !self.decoders.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<28} {:>14}", "Decoder", "Records")?;
            writeln!(f, "{:-<43}", "")?;
            for (name, count) in &self.decoders {
                writeln!(f, "{name:<28} {count:>14}")?;
            }
        }
        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "{:<28} {:>14}", "Error", "Count")?;
            writeln!(f, "{:-<43}", "")?;
            for (message, count) in &self.errors {
                writeln!(f, "{message:<28} {count:>14}")?;
            }
        }
        Ok(())
    }
}

/// Dispatcher, connection factory and UDP aggregator wired to one context.
///
/// Feed packets with [`submit`](Self::submit), then call
/// [`drain`](Self::drain) once the source is exhausted.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    dispatcher: Dispatcher,
    factory: Arc<ConnectionFactory>,
    udp: Arc<UdpStreamPool>,
    accepting: AtomicBool,
    summary: Mutex<Option<Summary>>,
}

impl Pipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Result<Self, PipelineError> {
        Self::build(ctx, None)
    }

    /// Mirror packets whose top layer is not recognized to `sink`. Mirroring
    /// never blocks; packets are dropped while the sink is full.
    pub fn with_unknown_sink(ctx: Arc<PipelineContext>, sink: Sender<RawPacket>) -> Result<Self, PipelineError> {
        Self::build(ctx, Some(sink))
    }

    fn build(ctx: Arc<PipelineContext>, unknown: Option<Sender<RawPacket>>) -> Result<Self, PipelineError> {
        let factory = Arc::new(ConnectionFactory::new(Arc::clone(&ctx)));
        let udp = Arc::new(UdpStreamPool::new(Arc::clone(&ctx)));
        let dispatcher = Dispatcher::new(Arc::clone(&ctx), Arc::clone(&factory), Arc::clone(&udp), unknown)?;
        Ok(Self {
            ctx,
            dispatcher,
            factory,
            udp,
            accepting: AtomicBool::new(true),
            summary: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn submit(&self, packet: RawPacket) -> Result<(), PipelineError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PipelineError::Stopped);
        }
        self.dispatcher.submit(packet)
    }

    /// Submit, waiting at most `config.submit_timeout` for room.
    pub fn submit_timeout(&self, packet: RawPacket) -> Result<(), PipelineError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(PipelineError::Stopped);
        }
        self.dispatcher
            .submit_timeout(packet, self.ctx.config.submit_timeout)
    }

    /// Current counters. After drain this is the final summary.
    pub fn summary(&self) -> Summary {
        if let Some(summary) = self.summary.lock().as_ref() {
            return summary.clone();
        }
        self.snapshot(0, 0)
    }

    fn snapshot(&self, drained_connections: usize, drained_udp_streams: usize) -> Summary {
        Summary {
            stats: self.ctx.stats.snapshot(),
            protocols: self.ctx.protocols.snapshot(),
            errors: self.ctx.errors.snapshot(),
            services: self.ctx.services.service_count(),
            decoders: self.ctx.registry.record_counts(),
            worker_packets: self.dispatcher.submitted(),
            drained_connections,
            drained_udp_streams,
        }
    }

    /// Stop ingestion and persist everything still in flight.
    ///
    /// Every wait is bounded by the configured timeouts. The first call does
    /// the work; later calls return the same summary.
    pub fn drain(&self) -> Summary {
        let mut cached = self.summary.lock();
        if let Some(summary) = cached.as_ref() {
            return summary.clone();
        }
        let config = &self.ctx.config;

        self.accepting.store(false, Ordering::Release);
        tracing::info!("draining pipeline");

        let assemblers = self.dispatcher.shutdown(config.worker_ack_timeout);

        let mut flushed = 0;
        for mut assembler in assemblers {
            flushed += assembler.flush_all();
        }
        tracing::debug!(flushed, "flushed open connections");

        if !self.factory.wait_for_readers(config.reassembly_timeout) {
            tracing::warn!(
                active = self.factory.active_readers(),
                timeout_ms = config.reassembly_timeout.as_millis() as u64,
                "stream readers still running after timeout"
            );
            self.ctx.record_error("stream reader drain timeout");
        }

        let pending = self.factory.unsaved();
        let drained_connections = process_all(
            config.num_stream_workers,
            config.stream_processor_buffer,
            "tcp",
            pending,
            |conn: Arc<TcpConnection>| {
                conn.close_and_drain();
                for role in conn.unsaved_roles() {
                    conn.persist(role);
                }
            },
        );
        self.factory.prune();

        let drained_udp_streams = self.udp.flush();

        if let Err(e) = self.ctx.writer.flush() {
            tracing::error!(error = %e, "failed to flush writer");
            self.ctx.record_error(&e.to_string());
        }
        self.ctx.registry.finish();

        let summary = self.snapshot(drained_connections, drained_udp_streams);
        tracing::info!(
            packets = summary.stats.packets,
            tcp = summary.stats.saved_tcp_connections,
            udp = summary.stats.saved_udp_connections,
            decoded = summary.stats.decoded_conversations,
            "pipeline drained"
        );
        *cached = Some(summary.clone());
        summary
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.summary.lock().is_none() {
            self.drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::protocol::test_utils::{tcp_frame, udp_frame};
    use crate::writer::MemoryWriter;

    const SYN: u8 = 0x02;
    const ACK: u8 = 0x10;
    const PSH_ACK: u8 = 0x18;

    fn pipeline(writer: Arc<MemoryWriter>) -> Pipeline {
        let ctx = PipelineContext::builder(PipelineConfig {
            workers: 2,
            ..Default::default()
        })
        .writer(writer)
        .build()
        .unwrap();
        Pipeline::new(ctx).unwrap()
    }

    // Test 1: Unterminated TCP and UDP flows are persisted by drain
    #[test]
    fn test_drain_persists_open_streams() {
        let writer = Arc::new(MemoryWriter::new());
        let pipeline = pipeline(Arc::clone(&writer));
        let c = [10, 0, 0, 1];
        let s = [10, 0, 0, 2];
        let frames = [
            tcp_frame(c, s, 40000, 7000, 100, SYN, b""),
            tcp_frame(s, c, 7000, 40000, 500, SYN | ACK, b""),
            tcp_frame(c, s, 40000, 7000, 101, PSH_ACK, b"hello"),
            tcp_frame(s, c, 7000, 40000, 501, PSH_ACK, b"world"),
            udp_frame(c, s, 40001, 9999, b"ping"),
        ];
        for (i, frame) in frames.into_iter().enumerate() {
            pipeline
                .submit(RawPacket::ethernet(i as u64 + 1, (i as i64 + 1) * 1000, frame))
                .unwrap();
        }

        let summary = pipeline.drain();
        assert_eq!(summary.stats.saved_tcp_connections, 1);
        assert_eq!(summary.stats.saved_udp_connections, 1);
        assert_eq!(writer.conversations().len(), 2);
        assert_eq!(summary.worker_packets.iter().sum::<u64>(), 5);
    }

    // Test 2: Drain runs once
    #[test]
    fn test_drain_idempotent() {
        let writer = Arc::new(MemoryWriter::new());
        let pipeline = pipeline(Arc::clone(&writer));
        let frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40001, 9999, b"ping");
        pipeline.submit(RawPacket::ethernet(1, 1, frame)).unwrap();

        let first = pipeline.drain();
        let second = pipeline.drain();
        assert_eq!(first.stats, second.stats);
        assert_eq!(writer.conversations().len(), 1);

        let frame = udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40001, 9999, b"late");
        assert!(matches!(
            pipeline.submit(RawPacket::ethernet(2, 2, frame)),
            Err(PipelineError::Stopped)
        ));
    }

    #[test]
    fn test_summary_display() {
        let summary = Summary {
            protocols: vec![("TCP".to_string(), 3)],
            decoders: vec![("http", 2)],
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("total packets"));
        assert!(text.contains("TCP"));
        assert!(text.contains("http"));
    }
}
