//! Segment-level TCP reassembly.
//!
//! A [`StreamPool`] holds every connection; each worker feeds it through
//! its own [`Assembler`]. Both halves of a connection are reordered by
//! sequence number and drive a [`ReassemblyStream`] through its three
//! callbacks:
//!
//! - `admit` for every segment, before anything else happens to it
//! - `deliver` for each contiguous, ordered byte range of one half
//! - `complete` for both halves once the connection ends
//!
//! Segments are first queued on their connection in arrival order, then
//! drained by whichever worker holds the connection lock. Queueing is
//! cheap and can happen in the dispatcher's packet order while the
//! reassembly work itself runs in parallel.
//!
//! The delivered slice borrows a scratch buffer the assembler reuses for
//! the next delivery, so implementations must copy what they keep.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::flow::{FlowIdent, FlowKey, TransportProtocol};
use crate::protocol::TcpSegment;

/// Half of a connection relative to the segment that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    /// Same sender as the first segment seen.
    Forward,
    Reverse,
}

impl FlowDirection {
    pub fn reverse(self) -> Self {
        match self {
            FlowDirection::Forward => FlowDirection::Reverse,
            FlowDirection::Reverse => FlowDirection::Forward,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            FlowDirection::Forward => 0,
            FlowDirection::Reverse => 1,
        }
    }
}

/// Bytes missing in front of a delivered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Skip {
    #[default]
    None,
    /// The half was picked up mid-stream; its start was never seen.
    MissingStart,
    /// Pending data was force-flushed over a gap of this many bytes.
    Lost(u32),
}

impl Skip {
    pub fn is_none(&self) -> bool {
        matches!(self, Skip::None)
    }

    pub fn missed_bytes(&self) -> u64 {
        match self {
            Skip::Lost(n) => u64::from(*n),
            _ => 0,
        }
    }
}

/// Per-delivery counters reported alongside the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub packets: u64,
    /// Number of segments concatenated into this range.
    pub chunks: u64,
    pub queued_bytes: u64,
    pub queued_packets: u64,
    pub overlap_bytes: u64,
    pub overlap_packets: u64,
}

/// One contiguous range of ordered bytes.
#[derive(Debug)]
pub struct Delivery<'a> {
    pub direction: FlowDirection,
    pub data: &'a [u8],
    pub skip: Skip,
    pub timestamp_us: i64,
    /// First delivery of this half.
    pub start: bool,
    /// Delivered while the connection was being closed.
    pub end: bool,
    pub stats: DeliveryStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Fin,
    Reset,
    Timeout,
    Flush,
}

/// End of one half of a connection.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub direction: FlowDirection,
    pub reason: CompletionReason,
    /// Earliest capture time of any segment of the connection.
    pub earliest_timestamp_us: i64,
    /// Sender of that earliest segment.
    pub earliest_flow: FlowIdent,
}

/// Callback contract between the assembler and one connection.
pub trait ReassemblyStream: Send + Sync {
    /// Decide whether a segment may feed the connection. `next_seq` is the
    /// next expected sequence number of the segment's half, if known.
    fn admit(&self, segment: &TcpSegment, direction: FlowDirection, next_seq: Option<u32>) -> bool;

    /// Receive an ordered range. `delivery.data` is only valid during the call.
    fn deliver(&self, delivery: &Delivery<'_>);

    /// No more data for this half. Return `true` to let the assembler forget
    /// the connection, `false` to keep admitting its segments.
    fn complete(&self, completion: &Completion) -> bool;
}

/// Creates a stream for each new connection.
pub trait StreamFactory: Send + Sync {
    fn new_stream(&self, flow: FlowIdent, segment: &TcpSegment) -> Arc<dyn ReassemblyStream>;
}

#[derive(Debug)]
struct PendingSegment {
    seq: u32,
    data: Bytes,
    timestamp_us: i64,
}

#[derive(Debug, Default)]
struct HalfState {
    next_seq: Option<u32>,
    /// Sequence origin for `pending` keys, so ordering survives wrap-around.
    base: u32,
    pending: BTreeMap<u32, PendingSegment>,
    skip: Skip,
    fin: bool,
    delivered: bool,
    last_timestamp_us: i64,
    overlap_bytes: u64,
    overlap_packets: u64,
}

impl HalfState {
    fn start(&mut self, seq: u32, skip: Skip) {
        self.next_seq = Some(seq);
        self.base = seq;
        self.skip = skip;
    }

    fn pending_key(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.base)
    }

    fn record_overlap(&mut self, bytes: usize) {
        self.overlap_bytes += bytes as u64;
        self.overlap_packets += 1;
    }
}

struct TrackedConnection {
    stream: Arc<dyn ReassemblyStream>,
    first_flow: FlowIdent,
    earliest_timestamp_us: i64,
    earliest_flow: FlowIdent,
    last_seen_us: i64,
    halves: [HalfState; 2],
    closed: bool,
    /// The stream asked to be forgotten; the entry is retired once its
    /// queue is empty.
    forget: bool,
}

impl TrackedConnection {
    fn direction_of(&self, flow: &FlowIdent) -> FlowDirection {
        if *flow == self.first_flow {
            FlowDirection::Forward
        } else {
            FlowDirection::Reverse
        }
    }
}

#[derive(Default)]
struct SegmentQueue {
    segments: VecDeque<TcpSegment>,
    /// No longer in the table; new segments must go to a fresh entry.
    retired: bool,
}

/// One tracked connection and the segments waiting for it.
///
/// Lock order is `conn` before `queue`. The queue lock is never held while
/// taking the table lock.
pub(crate) struct PoolEntry {
    key: FlowKey,
    queue: Mutex<SegmentQueue>,
    conn: Mutex<TrackedConnection>,
}

impl PoolEntry {
    fn pop(&self) -> Option<TcpSegment> {
        self.queue.lock().segments.pop_front()
    }
}

pub(crate) type SharedConnection = Arc<PoolEntry>;

/// Connection table shared by every [`Assembler`].
///
/// The table lock is only held for lookups; segment processing runs under
/// the connection's own lock, so distinct connections proceed in parallel.
pub struct StreamPool {
    factory: Arc<dyn StreamFactory>,
    connections: Mutex<HashMap<FlowKey, SharedConnection>>,
}

impl StreamPool {
    pub fn new(factory: Arc<dyn StreamFactory>) -> Self {
        Self {
            factory,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Number of connections currently tracked, closed ones included.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn get_or_create(&self, key: FlowKey, segment: &TcpSegment) -> SharedConnection {
        let mut connections = self.connections.lock();
        let conn = connections.entry(key).or_insert_with(|| {
            tracing::trace!(flow = %segment.flow, "new tcp connection");
            Arc::new(PoolEntry {
                key,
                queue: Mutex::new(SegmentQueue::default()),
                conn: Mutex::new(TrackedConnection {
                    stream: self.factory.new_stream(segment.flow, segment),
                    first_flow: segment.flow,
                    earliest_timestamp_us: segment.timestamp_us,
                    earliest_flow: segment.flow,
                    last_seen_us: segment.timestamp_us,
                    halves: Default::default(),
                    closed: false,
                    forget: false,
                }),
            })
        });
        Arc::clone(conn)
    }

    /// Queue a segment on its connection, creating the connection if
    /// needed. Segments of one connection are later processed in the order
    /// they were queued. Returns the entry to [`Assembler::drain`].
    pub(crate) fn enqueue(&self, segment: TcpSegment) -> SharedConnection {
        let key = segment.flow.key(TransportProtocol::Tcp);
        loop {
            let shared = self.get_or_create(key, &segment);
            let mut queue = shared.queue.lock();
            if !queue.retired {
                queue.segments.push_back(segment);
                drop(queue);
                return shared;
            }
            drop(queue);
            self.remove(&key, &shared);
        }
    }

    fn snapshot(&self) -> Vec<SharedConnection> {
        self.connections.lock().values().cloned().collect()
    }

    /// Take `shared` out of the table. Unless `force`, refuses while
    /// segments are still queued on it.
    fn retire(&self, shared: &SharedConnection, force: bool) -> bool {
        {
            let mut queue = shared.queue.lock();
            if !force && !queue.segments.is_empty() {
                return false;
            }
            queue.retired = true;
            queue.segments.clear();
        }
        self.remove(&shared.key, shared);
        true
    }

    /// Forget `conn` unless the key was already taken by a newer connection.
    fn remove(&self, key: &FlowKey, conn: &SharedConnection) {
        let mut connections = self.connections.lock();
        if connections.get(key).is_some_and(|c| Arc::ptr_eq(c, conn)) {
            connections.remove(key);
        }
    }
}

/// Per-worker reassembly context over a shared [`StreamPool`].
pub struct Assembler {
    pool: Arc<StreamPool>,
    scratch: Vec<u8>,
}

impl Assembler {
    pub fn new(pool: Arc<StreamPool>) -> Self {
        Self {
            pool,
            scratch: Vec::new(),
        }
    }

    pub fn pool(&self) -> &Arc<StreamPool> {
        &self.pool
    }

    pub fn connection_count(&self) -> usize {
        self.pool.connection_count()
    }

    /// Feed one segment.
    pub fn assemble(&mut self, segment: &TcpSegment) {
        let shared = self.pool.enqueue(segment.clone());
        self.drain(&shared);
    }

    /// Process every segment queued on `shared`, in queue order.
    pub(crate) fn drain(&mut self, shared: &SharedConnection) {
        let mut conn = shared.conn.lock();
        loop {
            drain_queue(shared, &mut conn, &mut self.scratch);
            if !conn.forget || self.pool.retire(shared, false) {
                break;
            }
        }
    }

    /// Force out pending data queued before `pending_cutoff` and close
    /// connections idle since before `inactive_cutoff`.
    ///
    /// Returns `(flushed, closed)`.
    pub fn flush_older_than(&mut self, pending_cutoff: i64, inactive_cutoff: i64) -> (usize, usize) {
        let mut flushed = 0;
        let mut closed = 0;

        for shared in self.pool.snapshot() {
            let mut conn = shared.conn.lock();
            drain_queue(&shared, &mut conn, &mut self.scratch);
            if conn.last_seen_us < inactive_cutoff {
                if conn.closed {
                    conn.forget = true;
                } else {
                    closed += 1;
                    if close_connection(&mut conn, CompletionReason::Timeout, &mut self.scratch) {
                        conn.forget = true;
                    }
                }
            } else if !conn.closed {
                flushed += flush_stale(&mut conn, pending_cutoff, &mut self.scratch);
            }
            // A refused retire is retried by the worker draining the queue.
            if conn.forget {
                self.pool.retire(&shared, false);
            }
        }

        if flushed > 0 || closed > 0 {
            tracing::debug!(flushed, closed, "flushed idle tcp state");
        }
        (flushed, closed)
    }

    /// Close every connection still open and empty the pool. Returns how
    /// many were closed.
    pub fn flush_all(&mut self) -> usize {
        let mut closed = 0;
        for shared in self.pool.snapshot() {
            let mut conn = shared.conn.lock();
            drain_queue(&shared, &mut conn, &mut self.scratch);
            if !conn.closed {
                closed += 1;
                close_connection(&mut conn, CompletionReason::Flush, &mut self.scratch);
            }
            self.pool.retire(&shared, true);
        }
        closed
    }
}

fn drain_queue(entry: &PoolEntry, conn: &mut TrackedConnection, scratch: &mut Vec<u8>) {
    while let Some(segment) = entry.pop() {
        if assemble_segment(conn, &segment, scratch) {
            conn.forget = true;
        }
    }
}

/// Run one segment through its connection. Returns whether the connection
/// should be forgotten.
fn assemble_segment(conn: &mut TrackedConnection, segment: &TcpSegment, scratch: &mut Vec<u8>) -> bool {
    let direction = conn.direction_of(&segment.flow);
    conn.last_seen_us = conn.last_seen_us.max(segment.timestamp_us);
    if segment.timestamp_us < conn.earliest_timestamp_us {
        conn.earliest_timestamp_us = segment.timestamp_us;
        conn.earliest_flow = segment.flow;
    }

    let next_seq = conn.halves[direction.index()].next_seq;
    if !conn.stream.admit(segment, direction, next_seq) || conn.closed {
        return false;
    }

    if segment.flags.rst {
        return close_connection(conn, CompletionReason::Reset, scratch);
    }

    let half = &mut conn.halves[direction.index()];
    if segment.flags.syn && half.next_seq.is_none() {
        half.start(segment.seq.wrapping_add(1), Skip::None);
    }
    if !segment.payload.is_empty() {
        let seq = if segment.flags.syn {
            segment.seq.wrapping_add(1)
        } else {
            segment.seq
        };
        if half.next_seq.is_none() {
            half.start(seq, Skip::MissingStart);
        }
        add_payload(
            conn.stream.as_ref(),
            half,
            direction,
            seq,
            segment.payload.clone(),
            segment.timestamp_us,
            scratch,
        );
    }
    if segment.flags.fin {
        half.fin = true;
    }

    conn.halves.iter().all(|h| h.fin) && close_connection(conn, CompletionReason::Fin, scratch)
}

/// Deliver pending segments queued before `cutoff`, giving up on the gaps
/// in front of them. Returns how many were delivered.
fn flush_stale(conn: &mut TrackedConnection, cutoff: i64, scratch: &mut Vec<u8>) -> usize {
    let mut flushed = 0;
    let stream = conn.stream.as_ref();
    for direction in [FlowDirection::Forward, FlowDirection::Reverse] {
        let half = &mut conn.halves[direction.index()];
        while half
            .pending
            .first_key_value()
            .is_some_and(|(_, p)| p.timestamp_us < cutoff)
        {
            flush_gap(stream, half, direction, false, scratch);
            flushed += 1;
        }
    }
    flushed
}

/// Place one payload into its half, delivering whatever became contiguous.
fn add_payload(
    stream: &dyn ReassemblyStream,
    half: &mut HalfState,
    direction: FlowDirection,
    seq: u32,
    mut data: Bytes,
    timestamp_us: i64,
    scratch: &mut Vec<u8>,
) {
    let Some(next) = half.next_seq else {
        return;
    };
    let end = seq_add(seq, data.len());
    let mut seq = seq;

    if seq_le(end, next) {
        half.record_overlap(data.len());
        return;
    }
    if seq_lt(seq, next) {
        let overlap = next.wrapping_sub(seq) as usize;
        half.record_overlap(overlap);
        data = data.slice(overlap..);
        seq = next;
    }

    if seq == next {
        deliver_contiguous(stream, half, direction, data, timestamp_us, false, scratch);
    } else {
        let key = half.pending_key(seq);
        let keep_existing = half
            .pending
            .get(&key)
            .is_some_and(|existing| existing.data.len() >= data.len());
        if keep_existing {
            half.record_overlap(data.len());
        } else {
            half.pending.insert(
                key,
                PendingSegment {
                    seq,
                    data,
                    timestamp_us,
                },
            );
        }
    }
}

/// Deliver `first` (starting at the half's next sequence number) together
/// with every pending segment that is now contiguous with it.
fn deliver_contiguous(
    stream: &dyn ReassemblyStream,
    half: &mut HalfState,
    direction: FlowDirection,
    first: Bytes,
    timestamp_us: i64,
    end: bool,
    scratch: &mut Vec<u8>,
) {
    let Some(start_seq) = half.next_seq else {
        return;
    };
    scratch.clear();
    scratch.extend_from_slice(&first);

    let mut stats = DeliveryStats {
        packets: 1,
        chunks: 1,
        overlap_bytes: std::mem::take(&mut half.overlap_bytes),
        overlap_packets: std::mem::take(&mut half.overlap_packets),
        ..Default::default()
    };
    let mut next = seq_add(start_seq, first.len());

    while let Some(entry) = half.pending.first_entry() {
        let pending = entry.get();
        let pending_end = seq_add(pending.seq, pending.data.len());
        if seq_le(pending_end, next) {
            stats.overlap_bytes += pending.data.len() as u64;
            stats.overlap_packets += 1;
            entry.remove();
            continue;
        }
        if seq_lt(next, pending.seq) {
            break;
        }
        let pending = entry.remove();
        let offset = next.wrapping_sub(pending.seq) as usize;
        if offset > 0 {
            stats.overlap_bytes += offset as u64;
            stats.overlap_packets += 1;
        }
        let tail = &pending.data[offset..];
        scratch.extend_from_slice(tail);
        stats.packets += 1;
        stats.chunks += 1;
        stats.queued_bytes += tail.len() as u64;
        stats.queued_packets += 1;
        next = pending_end;
    }
    half.next_seq = Some(next);

    let timestamp_us = timestamp_us.max(half.last_timestamp_us);
    half.last_timestamp_us = timestamp_us;
    let start = !half.delivered;
    half.delivered = true;

    stream.deliver(&Delivery {
        direction,
        data: scratch,
        skip: std::mem::take(&mut half.skip),
        timestamp_us,
        start,
        end,
        stats,
    });
}

/// Give up on the gap in front of the first pending segment and deliver it.
fn flush_gap(
    stream: &dyn ReassemblyStream,
    half: &mut HalfState,
    direction: FlowDirection,
    end: bool,
    scratch: &mut Vec<u8>,
) {
    let Some((_, pending)) = half.pending.pop_first() else {
        return;
    };
    let next = half.next_seq.unwrap_or(pending.seq);
    let gap = pending.seq.wrapping_sub(next);
    if gap > 0 {
        half.skip = Skip::Lost(gap);
    }
    half.next_seq = Some(pending.seq);
    deliver_contiguous(
        stream,
        half,
        direction,
        pending.data,
        pending.timestamp_us,
        end,
        scratch,
    );
}

/// Flush leftovers and complete both halves. Returns whether the stream
/// asked to be forgotten.
fn close_connection(
    conn: &mut TrackedConnection,
    reason: CompletionReason,
    scratch: &mut Vec<u8>,
) -> bool {
    if conn.closed {
        return false;
    }
    conn.closed = true;

    let stream = conn.stream.as_ref();
    for direction in [FlowDirection::Forward, FlowDirection::Reverse] {
        let half = &mut conn.halves[direction.index()];
        while !half.pending.is_empty() {
            flush_gap(stream, half, direction, true, scratch);
        }
    }

    let completion = |direction| Completion {
        direction,
        reason,
        earliest_timestamp_us: conn.earliest_timestamp_us,
        earliest_flow: conn.earliest_flow,
    };
    let forward = stream.complete(&completion(FlowDirection::Forward));
    let reverse = stream.complete(&completion(FlowDirection::Reverse));
    tracing::trace!(flow = %conn.first_flow, ?reason, "tcp connection complete");
    forward && reverse
}

// Sequence number comparison helpers
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TcpFlags;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Data {
            direction: FlowDirection,
            data: Vec<u8>,
            skip: Skip,
            timestamp_us: i64,
            stats: DeliveryStats,
        },
        Complete(FlowDirection, CompletionReason),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        admitted: Mutex<usize>,
        keep: bool,
        reject_all: bool,
    }

    impl ReassemblyStream for Recorder {
        fn admit(&self, _: &TcpSegment, _: FlowDirection, _: Option<u32>) -> bool {
            *self.admitted.lock() += 1;
            !self.reject_all
        }

        fn deliver(&self, d: &Delivery<'_>) {
            self.events.lock().push(Event::Data {
                direction: d.direction,
                data: d.data.to_vec(),
                skip: d.skip,
                timestamp_us: d.timestamp_us,
                stats: d.stats,
            });
        }

        fn complete(&self, c: &Completion) -> bool {
            self.events
                .lock()
                .push(Event::Complete(c.direction, c.reason));
            !self.keep
        }
    }

    struct OneStream(Arc<Recorder>);

    impl StreamFactory for OneStream {
        fn new_stream(&self, _: FlowIdent, _: &TcpSegment) -> Arc<dyn ReassemblyStream> {
            self.0.clone()
        }
    }

    fn setup(recorder: Recorder) -> (Assembler, Arc<Recorder>) {
        let recorder = Arc::new(recorder);
        let pool = StreamPool::new(Arc::new(OneStream(recorder.clone())));
        (Assembler::new(Arc::new(pool)), recorder)
    }

    fn client() -> FlowIdent {
        FlowIdent::new(
            "10.0.0.1:51000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    fn seg(flow: FlowIdent, seq: u32, flags: TcpFlags, payload: &'static [u8], ts: i64) -> TcpSegment {
        TcpSegment::new(flow, seq, flags, Bytes::from_static(payload), ts)
    }

    fn data_of(events: &[Event], direction: FlowDirection) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Data {
                    direction: d, data, ..
                } if *d == direction => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    // Test 1: In-order delivery after a handshake
    #[test]
    fn test_in_order_delivery() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 1000, TcpFlags::SYN, b"", 1));
        asm.assemble(&seg(client().reverse(), 5000, TcpFlags::SYN_ACK, b"", 2));
        asm.assemble(&seg(client(), 1001, TcpFlags::ACK, b"Hello", 3));
        asm.assemble(&seg(client(), 1006, TcpFlags::ACK, b" World", 4));

        let events = rec.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(data_of(&events, FlowDirection::Forward), b"Hello World");
        match &events[0] {
            Event::Data { skip, .. } => assert_eq!(*skip, Skip::None),
            other => panic!("unexpected {other:?}"),
        }
    }

    // Test 2: Out-of-order segments are queued and released together
    #[test]
    fn test_out_of_order() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 1));
        asm.assemble(&seg(client(), 6, TcpFlags::ACK, b"World", 3));
        assert!(rec.events.lock().is_empty());
        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"Hello", 4));

        let events = rec.events.lock().clone();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Data { data, stats, .. } => {
                assert_eq!(data, b"HelloWorld");
                assert_eq!(stats.chunks, 2);
                assert_eq!(stats.queued_packets, 1);
                assert_eq!(stats.queued_bytes, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // Test 3: Retransmissions and partial overlaps are trimmed
    #[test]
    fn test_overlap_trimmed() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 1));
        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"abc", 2));
        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"abc", 3));
        asm.assemble(&seg(client(), 2, TcpFlags::ACK, b"bcdef", 4));

        let events = rec.events.lock().clone();
        assert_eq!(data_of(&events, FlowDirection::Forward), b"abcdef");
        match events.last() {
            Some(Event::Data { stats, .. }) => {
                assert_eq!(stats.overlap_packets, 2);
                assert_eq!(stats.overlap_bytes, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // Test 4: Mid-stream pickup is flagged once
    #[test]
    fn test_missing_start() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 777, TcpFlags::ACK, b"mid", 1));
        asm.assemble(&seg(client(), 780, TcpFlags::ACK, b"dle", 2));

        let events = rec.events.lock().clone();
        let skips: Vec<Skip> = events
            .iter()
            .filter_map(|e| match e {
                Event::Data { skip, .. } => Some(*skip),
                _ => None,
            })
            .collect();
        assert_eq!(skips, vec![Skip::MissingStart, Skip::None]);
    }

    // Test 5: Stale pending data is flushed over the gap
    #[test]
    fn test_flush_older_than_reports_gap() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 1));
        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"ab", 2));
        asm.assemble(&seg(client(), 10, TcpFlags::ACK, b"later", 3));

        let (flushed, closed) = asm.flush_older_than(100, 0);
        assert_eq!((flushed, closed), (1, 0));
        let events = rec.events.lock().clone();
        match events.last() {
            Some(Event::Data { data, skip, .. }) => {
                assert_eq!(data, b"later");
                assert_eq!(*skip, Skip::Lost(7));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // Test 6: Both FINs complete both halves and evict
    #[test]
    fn test_fin_completes() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 1));
        asm.assemble(&seg(client(), 1, TcpFlags::FIN_ACK, b"", 2));
        assert_eq!(asm.connection_count(), 1);
        asm.assemble(&seg(client().reverse(), 0, TcpFlags::FIN_ACK, b"", 3));

        let events = rec.events.lock().clone();
        assert_eq!(
            events,
            vec![
                Event::Complete(FlowDirection::Forward, CompletionReason::Fin),
                Event::Complete(FlowDirection::Reverse, CompletionReason::Fin),
            ]
        );
        assert_eq!(asm.connection_count(), 0);
    }

    // Test 7: Kept connections see admit calls but no deliveries
    #[test]
    fn test_kept_after_reset() {
        let (mut asm, rec) = setup(Recorder {
            keep: true,
            ..Default::default()
        });
        asm.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 1));
        asm.assemble(&seg(client().reverse(), 0, TcpFlags::RST, b"", 2));
        assert_eq!(asm.connection_count(), 1);

        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"late", 3));
        assert_eq!(*rec.admitted.lock(), 3);
        let events = rec.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            Event::Complete(_, CompletionReason::Reset)
        ));

        assert_eq!(asm.flush_all(), 0);
        assert_eq!(asm.connection_count(), 0);
    }

    // Test 8: Rejected segments never reach delivery
    #[test]
    fn test_rejected_segments() {
        let (mut asm, rec) = setup(Recorder {
            reject_all: true,
            ..Default::default()
        });
        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"data", 1));
        assert!(rec.events.lock().is_empty());
        assert_eq!(asm.flush_all(), 1);
    }

    // Test 9: Sequence numbers wrapping past u32::MAX
    #[test]
    fn test_sequence_wraparound() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), u32::MAX - 2, TcpFlags::SYN, b"", 1));
        asm.assemble(&seg(client(), 2, TcpFlags::ACK, b"efg", 3));
        asm.assemble(&seg(client(), u32::MAX - 1, TcpFlags::ACK, b"abcd", 2));

        let events = rec.events.lock().clone();
        assert_eq!(data_of(&events, FlowDirection::Forward), b"abcdefg");
    }

    // Test 10: Delivery timestamps never go backwards within a half
    #[test]
    fn test_timestamps_clamped() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 10));
        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"a", 50));
        asm.assemble(&seg(client(), 2, TcpFlags::ACK, b"b", 20));

        let stamps: Vec<i64> = rec
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Data { timestamp_us, .. } => Some(*timestamp_us),
                _ => None,
            })
            .collect();
        assert_eq!(stamps, vec![50, 50]);
    }

    // Test 11: Idle connections time out
    #[test]
    fn test_inactive_timeout() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 1, TcpFlags::ACK, b"x", 5));
        assert_eq!(asm.flush_older_than(0, 100), (0, 1));
        assert_eq!(asm.connection_count(), 0);
        assert!(matches!(
            rec.events.lock().last(),
            Some(Event::Complete(_, CompletionReason::Timeout))
        ));
    }

    // Test 12: Workers sharing a pool reassemble one connection together
    #[test]
    fn test_shared_pool() {
        let (mut first, rec) = setup(Recorder::default());
        let mut second = Assembler::new(Arc::clone(first.pool()));
        first.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 1));
        second.assemble(&seg(client(), 4, TcpFlags::ACK, b"def", 3));
        first.assemble(&seg(client(), 1, TcpFlags::ACK, b"abc", 2));

        assert_eq!(second.connection_count(), 1);
        assert_eq!(data_of(&rec.events.lock(), FlowDirection::Forward), b"abcdef");
        assert_eq!(second.flush_all(), 1);
        assert_eq!(first.connection_count(), 0);
    }

    // Test 13: Segments queued by different workers are processed in queue order
    #[test]
    fn test_queue_order_across_workers() {
        let (mut first, rec) = setup(Recorder::default());
        let mut second = Assembler::new(Arc::clone(first.pool()));
        let syn = first.pool().enqueue(seg(client(), 0, TcpFlags::SYN, b"", 1));
        let data = second.pool().enqueue(seg(client(), 1, TcpFlags::ACK, b"hello", 2));
        assert!(Arc::ptr_eq(&syn, &data));

        // The later segment's worker gets the lock first and drains both.
        second.drain(&data);
        first.drain(&syn);

        let events = rec.events.lock().clone();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Data { data, skip, .. } => {
                assert_eq!(data, b"hello");
                assert_eq!(*skip, Skip::None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // Test 14: A retired entry still in the table is replaced, not fed
    #[test]
    fn test_retired_entry_replaced() {
        let (mut asm, rec) = setup(Recorder::default());
        let old = asm.pool().enqueue(seg(client(), 0, TcpFlags::SYN, b"", 1));
        asm.drain(&old);
        old.queue.lock().retired = true;

        let fresh = asm.pool().enqueue(seg(client(), 100, TcpFlags::SYN, b"", 2));
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(old.queue.lock().segments.is_empty());
        assert_eq!(asm.connection_count(), 1);
        asm.drain(&fresh);
        assert_eq!(*rec.admitted.lock(), 2);
    }

    // Test 15: Segments queued behind a completing segment do not revive it
    #[test]
    fn test_queued_after_completion() {
        let (mut asm, rec) = setup(Recorder::default());
        asm.assemble(&seg(client(), 0, TcpFlags::SYN, b"", 1));
        let shared = asm.pool().enqueue(seg(client(), 1, TcpFlags::FIN_ACK, b"", 2));
        asm.pool().enqueue(seg(client().reverse(), 0, TcpFlags::FIN_ACK, b"", 3));
        asm.pool().enqueue(seg(client(), 2, TcpFlags::ACK, b"late", 4));
        asm.drain(&shared);

        assert_eq!(asm.connection_count(), 0);
        assert!(shared.queue.lock().retired);
        let events = rec.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, Event::Complete(_, CompletionReason::Fin))));
    }
}
