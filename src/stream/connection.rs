use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::Sender;

use crate::context::PipelineContext;
use crate::decoder::decode_conversation;
use crate::flow::{FlowIdent, TransportProtocol};
use crate::protocol::TcpSegment;
use crate::stats::ReassemblyStats;

use super::engine::{Completion, Delivery, FlowDirection, ReassemblyStream, Skip};
use super::fsm::{FsmState, OptionChecker, TcpFsm};
use super::reader::{Chunk, StreamReader};
use super::Conversation;

/// Which side of a connection a completion or reader belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug)]
struct ConnState {
    /// Oriented client to server.
    ident: FlowIdent,
    /// Engine half currently considered the client.
    client: FlowDirection,
    first_packet: i64,
    fsm: TcpFsm,
    options: OptionChecker,
    fsm_failed: bool,
    flips: u32,
}

/// One bidirectional TCP flow.
///
/// Implements the reassembly callbacks and owns one [`StreamReader`] per
/// engine half. Readers are indexed by [`FlowDirection`]; which of them is
/// the client may change once, when an earlier segment shows the initial
/// guess was wrong.
///
/// Lock order is connection state first, then reader state.
pub struct TcpConnection {
    id: u64,
    ctx: Arc<PipelineContext>,
    readers: [Arc<StreamReader>; 2],
    senders: [Mutex<Option<Sender<Chunk>>>; 2],
    state: Mutex<ConnState>,
}

impl TcpConnection {
    pub(crate) fn new(
        id: u64,
        ctx: Arc<PipelineContext>,
        readers: [Arc<StreamReader>; 2],
        senders: [Sender<Chunk>; 2],
        first_packet: i64,
    ) -> Self {
        let ident = readers[FlowDirection::Forward.index()].flow();
        let [forward, reverse] = senders;
        let allow_missing_init = ctx.config.allow_missing_init;
        Self {
            id,
            ctx,
            readers,
            senders: [Mutex::new(Some(forward)), Mutex::new(Some(reverse))],
            state: Mutex::new(ConnState {
                ident,
                client: FlowDirection::Forward,
                first_packet,
                fsm: TcpFsm::new(allow_missing_init),
                options: OptionChecker::new(),
                fsm_failed: false,
                flips: 0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flow identity oriented client to server.
    pub fn ident(&self) -> FlowIdent {
        self.state.lock().ident
    }

    pub fn first_packet(&self) -> i64 {
        self.state.lock().first_packet
    }

    pub fn fsm_state(&self) -> FsmState {
        self.state.lock().fsm.state()
    }

    /// How many times client and server were swapped.
    pub fn flips(&self) -> u32 {
        self.state.lock().flips
    }

    pub fn reader(&self, role: Role) -> Arc<StreamReader> {
        let state = self.state.lock();
        Arc::clone(&self.readers[Self::direction_of(&state, role).index()])
    }

    fn direction_of(state: &ConnState, role: Role) -> FlowDirection {
        match role {
            Role::Client => state.client,
            Role::Server => state.client.reverse(),
        }
    }

    /// Roles whose reader has not been persisted yet.
    pub fn unsaved_roles(&self) -> Vec<Role> {
        [Role::Client, Role::Server]
            .into_iter()
            .filter(|&role| !self.reader(role).saved())
            .collect()
    }

    pub fn is_saved(&self) -> bool {
        self.readers.iter().all(|r| r.saved())
    }

    /// Close both reader channels and wait, bounded, for the consumers.
    pub(crate) fn close_and_drain(&self) -> bool {
        for sender in &self.senders {
            sender.lock().take();
        }
        let timeout = self.ctx.config.stream_drain_timeout;
        let drained = self.readers.iter().all(|r| r.wait_finished(timeout));
        if !drained {
            tracing::warn!(id = self.id, ident = %self.ident(), "stream readers did not drain in time");
            self.ctx.record_error("stream reader drain timeout");
        }
        drained
    }

    /// Swap client and server if the earliest segment came from the side
    /// currently labelled server.
    fn reorder(&self, state: &mut ConnState, completion: &Completion) {
        if completion.earliest_timestamp_us < state.first_packet {
            state.first_packet = completion.earliest_timestamp_us;
        }
        let client_flow = self.readers[state.client.index()].flow();
        if client_flow == completion.earliest_flow {
            return;
        }

        let old_client = state.client;
        state.client = old_client.reverse();
        state.ident = state.ident.reverse();
        state.flips += 1;
        self.readers[state.client.index()].set_client(true);
        self.readers[old_client.index()].set_client(false);
        tracing::debug!(id = self.id, ident = %state.ident, "flipped client and server");
    }

    /// Save one side of the connection, at most once per side.
    ///
    /// The client side merges both directions, persists the conversation
    /// and runs the decoder. The server side hands its banner to service
    /// identification.
    pub(crate) fn persist(&self, role: Role) {
        match role {
            Role::Client => self.persist_client(),
            Role::Server => self.persist_server(),
        }
    }

    fn persist_client(&self) {
        let conversation = {
            let state = self.state.lock();
            let client = &self.readers[state.client.index()];
            if !client.mark_saved() {
                return;
            }
            let server = &self.readers[state.client.reverse().index()];
            Conversation::merge(
                state.ident,
                TransportProtocol::Tcp,
                &client.fragments(),
                &server.fragments(),
            )
        };
        let conversation = Arc::new(conversation);

        if self.ctx.config.save_conversations {
            match self.ctx.writer.save_conversation(&conversation) {
                Ok(()) => ReassemblyStats::incr(&self.ctx.stats.saved_tcp_connections),
                Err(e) => {
                    tracing::warn!(ident = %conversation.ident(), error = %e, "failed to save conversation");
                    self.ctx.record_error(&e.to_string());
                }
            }
        }
        decode_conversation(&self.ctx, conversation);
    }

    fn persist_server(&self) {
        let (banner, ident, first_packet) = {
            let state = self.state.lock();
            let server = &self.readers[state.client.reverse().index()];
            if !server.mark_saved() {
                return;
            }
            (
                server.banner(self.ctx.config.banner_size),
                state.ident,
                state.first_packet,
            )
        };
        if !banner.is_empty() {
            self.ctx
                .services
                .identify(&banner, &ident, first_packet, TransportProtocol::Tcp);
        }
    }
}

impl ReassemblyStream for TcpConnection {
    fn admit(&self, segment: &TcpSegment, direction: FlowDirection, next_seq: Option<u32>) -> bool {
        let config = &self.ctx.config;
        let stats = &self.ctx.stats;
        let mut state = self.state.lock();

        if !state.fsm.check(segment.flags, direction) {
            ReassemblyStats::incr(&stats.rejected_fsm);
            if !state.fsm_failed {
                state.fsm_failed = true;
                ReassemblyStats::incr(&stats.rejected_conn_fsm);
            }
            if !config.ignore_fsm_err {
                tracing::trace!(id = self.id, state = state.fsm.state().as_str(), "segment rejected by state machine");
                return false;
            }
        }

        if let Err(violation) = state.options.accept(segment, direction, next_seq) {
            ReassemblyStats::incr(&stats.rejected_options);
            if !config.no_opt_check {
                tracing::trace!(id = self.id, %violation, "segment rejected by option checker");
                return false;
            }
        }

        if config.checksum && segment.checksum_valid == Some(false) {
            ReassemblyStats::incr(&stats.rejected_options);
            tracing::trace!(id = self.id, "segment rejected: invalid checksum");
            return false;
        }
        true
    }

    fn deliver(&self, delivery: &Delivery<'_>) {
        let stats = &self.ctx.stats;
        let counters = &delivery.stats;
        let length = delivery.data.len() as u64;

        ReassemblyStats::add(&stats.missed_bytes, delivery.skip.missed_bytes());
        ReassemblyStats::add(&stats.packets, counters.packets);
        if counters.chunks > 1 {
            ReassemblyStats::incr(&stats.reassembled_chunks);
        }
        ReassemblyStats::add(&stats.out_of_order_packets, counters.queued_packets);
        ReassemblyStats::add(&stats.out_of_order_bytes, counters.queued_bytes);
        ReassemblyStats::max(&stats.biggest_chunk_bytes, length);
        ReassemblyStats::max(&stats.biggest_chunk_packets, counters.packets);
        ReassemblyStats::add(&stats.overlap_bytes, counters.overlap_bytes);
        ReassemblyStats::add(&stats.overlap_packets, counters.overlap_packets);
        ReassemblyStats::add(&stats.total_tcp_bytes, length);

        if delivery.skip != Skip::None && !self.ctx.config.allow_missing_init {
            tracing::trace!(id = self.id, skip = ?delivery.skip, "discarding range after missing data");
            return;
        }
        if delivery.data.is_empty() {
            return;
        }

        let sender = self.senders[delivery.direction.index()].lock().clone();
        let chunk = Chunk {
            data: Bytes::copy_from_slice(delivery.data),
            timestamp_us: delivery.timestamp_us,
        };
        match sender.map(|tx| tx.blocking_send(chunk)) {
            Some(Ok(())) => ReassemblyStats::add(&stats.reassembled_bytes, length),
            _ => ReassemblyStats::incr(&stats.dropped_after_close),
        }
    }

    fn complete(&self, completion: &Completion) -> bool {
        self.close_and_drain();
        let role = {
            let mut state = self.state.lock();
            self.reorder(&mut state, completion);
            if state.client == completion.direction {
                Role::Client
            } else {
                Role::Server
            }
        };
        tracing::trace!(id = self.id, ?role, reason = ?completion.reason, "stream complete");
        self.persist(role);
        self.ctx.config.remove_closed_streams
    }
}
