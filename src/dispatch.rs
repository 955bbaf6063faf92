//! Packet dispatcher: a fixed pool of workers fed round-robin.
//!
//! Every worker owns one [`Assembler`] over a shared [`StreamPool`];
//! segments of distinct connections are reassembled in parallel and only
//! contend on their own connection's lock. Shutdown sends a `None`
//! sentinel down every channel and collects the assemblers back, bounded
//! per worker.
//!
//! Packets are stamped in submission order. Workers parse in parallel but
//! queue segments and datagrams on their flows strictly by stamp, so a
//! connection split across workers still sees its packets in capture
//! order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::pcap::RawPacket;
use crate::protocol::{parse_packet, Transport, UNKNOWN_LAYER};
use crate::stream::{Assembler, ConnectionFactory, StreamFactory, StreamPool, UdpStreamPool};

/// A packet and its position in submission order.
struct Stamped {
    seq: u64,
    packet: RawPacket,
}

/// Lets workers queue packets onto shared flow state one stamp at a time.
struct Sequencer {
    next: Mutex<u64>,
    turn: Condvar,
    timeout: Duration,
}

impl Sequencer {
    fn new(timeout: Duration) -> Self {
        Self {
            next: Mutex::new(0),
            turn: Condvar::new(),
            timeout,
        }
    }

    /// Wait until every earlier stamp has had its turn, or until the
    /// timeout runs out.
    fn enter(&self, seq: u64) -> Turn<'_> {
        let deadline = Instant::now() + self.timeout;
        let mut next = self.next.lock();
        let mut skipped = false;
        while *next < seq {
            if self.turn.wait_until(&mut next, deadline).timed_out() {
                skipped = *next < seq;
                break;
            }
        }
        Turn {
            sequencer: self,
            seq,
            skipped,
        }
    }
}

/// Held while a packet is queued; the next stamp may enter on drop.
struct Turn<'a> {
    sequencer: &'a Sequencer,
    seq: u64,
    /// Entered after a timeout, ahead of a missing earlier stamp.
    skipped: bool,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut next = self.sequencer.next.lock();
        *next = (*next).max(self.seq + 1);
        drop(next);
        self.sequencer.turn.notify_all();
    }
}

/// Sent by a worker once it has seen the shutdown sentinel.
struct WorkerAck {
    id: usize,
    assembler: Assembler,
}

pub struct Dispatcher {
    ctx: Arc<PipelineContext>,
    senders: Vec<Sender<Option<Stamped>>>,
    submitted: Arc<[AtomicU64]>,
    /// Next stamp. Held across the send so stamps enter channels in order.
    next: Mutex<u64>,
    acks: Receiver<WorkerAck>,
    handles: Mutex<Vec<Option<JoinHandle<()>>>>,
    stopped: AtomicBool,
}

impl Dispatcher {
    /// Spawn `config.workers` workers. Mirrors packets with an unrecognized
    /// top layer to `unknown` when given.
    pub fn new(
        ctx: Arc<PipelineContext>,
        factory: Arc<ConnectionFactory>,
        udp: Arc<UdpStreamPool>,
        unknown: Option<Sender<RawPacket>>,
    ) -> Result<Self, PipelineError> {
        let count = ctx.config.workers.max(1);
        let (ack_tx, acks) = bounded(count);
        let submitted: Arc<[AtomicU64]> = (0..count).map(|_| AtomicU64::new(0)).collect();
        let pool = Arc::new(StreamPool::new(Arc::clone(&factory) as Arc<dyn StreamFactory>));
        let sequencer = Arc::new(Sequencer::new(ctx.config.ordering_timeout));

        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = bounded(ctx.config.packet_buffer);
            let worker = Worker {
                id,
                ctx: Arc::clone(&ctx),
                assembler: Assembler::new(Arc::clone(&pool)),
                sequencer: Arc::clone(&sequencer),
                factory: Arc::clone(&factory),
                udp: Arc::clone(&udp),
                unknown: unknown.clone(),
                since_flush: 0,
            };
            let ack_tx = ack_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("dispatch-{id}"))
                .spawn(move || worker.run(rx, ack_tx))
                .map_err(PipelineError::Spawn)?;
            senders.push(tx);
            handles.push(Some(handle));
        }
        tracing::debug!(workers = count, "dispatcher started");

        Ok(Self {
            ctx,
            senders,
            submitted,
            next: Mutex::new(0),
            acks,
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    fn worker_for(&self, seq: u64) -> usize {
        (seq % self.senders.len() as u64) as usize
    }

    /// Hand a packet to the next worker, blocking while its channel is full.
    pub fn submit(&self, packet: RawPacket) -> Result<(), PipelineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PipelineError::Stopped);
        }
        let mut next = self.next.lock();
        let seq = *next;
        let worker = self.worker_for(seq);
        self.senders[worker]
            .send(Some(Stamped { seq, packet }))
            .map_err(|_| PipelineError::Stopped)?;
        *next += 1;
        drop(next);
        self.submitted[worker].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Like [`submit`](Self::submit), giving up after `timeout`.
    pub fn submit_timeout(&self, packet: RawPacket, timeout: Duration) -> Result<(), PipelineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PipelineError::Stopped);
        }
        let mut next = self.next.lock();
        let seq = *next;
        let worker = self.worker_for(seq);
        match self.senders[worker].send_timeout(Some(Stamped { seq, packet }), timeout) {
            Ok(()) => {
                *next += 1;
                drop(next);
                self.submitted[worker].fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(PipelineError::SubmitTimeout {
                worker,
                timeout_ms: timeout.as_millis(),
            }),
            Err(SendTimeoutError::Disconnected(_)) => Err(PipelineError::Stopped),
        }
    }

    /// Packets accepted per worker.
    pub fn submitted(&self) -> Vec<u64> {
        self.submitted
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Stop every worker and take back the assemblers of those that
    /// acknowledged within `timeout`. Stuck workers are logged and left
    /// behind. Only the first call does anything.
    pub fn shutdown(&self, timeout: Duration) -> Vec<Assembler> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        for (id, tx) in self.senders.iter().enumerate() {
            if tx.send_timeout(None, timeout).is_err() {
                tracing::warn!(worker = id, "worker did not take the shutdown sentinel");
            }
        }

        let count = self.senders.len();
        let mut acked = vec![false; count];
        let mut assemblers = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acks.recv_timeout(timeout) {
                Ok(ack) => {
                    acked[ack.id] = true;
                    assemblers.push(ack.assembler);
                }
                Err(_) => break,
            }
        }

        let mut handles = self.handles.lock();
        for (id, done) in acked.into_iter().enumerate() {
            if !done {
                tracing::warn!(worker = id, timeout_ms = timeout.as_millis() as u64, "worker did not acknowledge shutdown, skipping");
                self.ctx.record_error("dispatcher worker shutdown timeout");
                continue;
            }
            if let Some(handle) = handles[id].take() {
                if handle.join().is_err() {
                    tracing::error!(worker = id, "dispatcher worker panicked");
                }
            }
        }
        tracing::debug!(acked = assemblers.len(), workers = count, "dispatcher stopped");
        assemblers
    }
}

struct Worker {
    id: usize,
    ctx: Arc<PipelineContext>,
    assembler: Assembler,
    sequencer: Arc<Sequencer>,
    factory: Arc<ConnectionFactory>,
    udp: Arc<UdpStreamPool>,
    unknown: Option<Sender<RawPacket>>,
    since_flush: usize,
}

impl Worker {
    fn run(mut self, rx: Receiver<Option<Stamped>>, acks: Sender<WorkerAck>) {
        while let Ok(Some(packet)) = rx.recv() {
            self.handle(packet);
        }
        tracing::trace!(worker = self.id, connections = self.assembler.connection_count(), "worker draining");
        let _ = acks.send(WorkerAck {
            id: self.id,
            assembler: self.assembler,
        });
    }

    fn handle(&mut self, stamped: Stamped) {
        let Stamped { seq, packet } = stamped;
        let parsed = parse_packet(&packet, self.ctx.config.checksum);

        let turn = self.sequencer.enter(seq);
        if turn.skipped {
            tracing::warn!(
                worker = self.id,
                frame = packet.frame_number,
                timeout_ms = self.ctx.config.ordering_timeout.as_millis() as u64,
                "earlier packets not queued in time, queueing out of order"
            );
            self.ctx.record_error("packet ordering timeout");
        }
        let queued = match parsed.as_ref().map(|p| &p.transport) {
            Ok(Transport::Tcp(segment)) => Some(self.assembler.pool().enqueue(segment.clone())),
            Ok(Transport::Udp(datagram)) => {
                self.udp.handle(datagram);
                None
            }
            _ => None,
        };
        drop(turn);

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::trace!(worker = self.id, frame = packet.frame_number, error = %e, "unparseable packet");
                self.ctx.record_error(&e.to_string());
                self.mirror_unknown(packet);
                return;
            }
        };

        for layer in &parsed.layers {
            self.ctx.protocols.increment(layer);
        }

        let timestamp = packet.timestamp_us;
        if let Some(shared) = queued {
            self.assembler.drain(&shared);
        }
        if parsed.unknown {
            self.mirror_unknown(packet);
        }
        self.maybe_flush(timestamp);
    }

    fn mirror_unknown(&self, packet: RawPacket) {
        self.ctx.protocols.increment(UNKNOWN_LAYER);
        if let Some(sink) = &self.unknown {
            let _ = sink.try_send(packet);
        }
    }

    /// Periodically force out stale pending data and idle flows, measured
    /// in capture time.
    fn maybe_flush(&mut self, now_us: i64) {
        let every = self.ctx.config.flush_every;
        if every == 0 {
            return;
        }
        self.since_flush += 1;
        if self.since_flush < every {
            return;
        }
        self.since_flush = 0;

        let config = &self.ctx.config;
        let inactive_cutoff = now_us.saturating_sub(config.close_inactive_us());
        let (flushed, closed) = self
            .assembler
            .flush_older_than(now_us.saturating_sub(config.close_pending_us()), inactive_cutoff);
        let udp = self.udp.flush_older_than(inactive_cutoff);
        let pruned = self.factory.prune();
        if flushed + closed + udp > 0 {
            tracing::debug!(worker = self.id, flushed, closed, udp, pruned, "periodic flush");
        }
    }
}
