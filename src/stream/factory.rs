use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{channel, Sender};

use crate::context::PipelineContext;
use crate::flow::FlowIdent;
use crate::protocol::TcpSegment;

use super::connection::TcpConnection;
use super::engine::{FlowDirection, ReassemblyStream, StreamFactory};
use super::reader::{ActiveReaders, Chunk, StreamReader};

/// Creates a [`TcpConnection`] with its two reader tasks for every new
/// flow, and remembers connections until both sides are saved.
///
/// Reader tasks run on the context's fixed-size reader runtime, so the
/// number of open flows does not bound the number of threads.
pub struct ConnectionFactory {
    ctx: Arc<PipelineContext>,
    active: Arc<ActiveReaders>,
    connections: Mutex<Vec<Arc<TcpConnection>>>,
    next_id: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            active: Arc::new(ActiveReaders::new()),
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build a connection without handing it to an assembler.
    pub fn create(&self, flow: FlowIdent, first_packet: i64) -> Arc<TcpConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (forward, forward_tx) = self.spawn_reader(id, FlowDirection::Forward, flow);
        let (reverse, reverse_tx) = self.spawn_reader(id, FlowDirection::Reverse, flow.reverse());

        let conn = Arc::new(TcpConnection::new(
            id,
            Arc::clone(&self.ctx),
            [forward, reverse],
            [forward_tx, reverse_tx],
            first_packet,
        ));
        self.connections.lock().push(Arc::clone(&conn));
        conn
    }

    /// Start the consumer task for one half. The forward half starts out
    /// as the client.
    fn spawn_reader(&self, id: u64, direction: FlowDirection, flow: FlowIdent) -> (Arc<StreamReader>, Sender<Chunk>) {
        let reader = Arc::new(StreamReader::new(flow, direction == FlowDirection::Forward));
        let (tx, rx) = channel(self.ctx.config.stream_buffer);
        let consumer = Arc::clone(&reader).consume(rx, self.active.register());
        self.ctx.readers().spawn(consumer);
        tracing::trace!(id, half = direction.index(), "stream reader started");
        (reader, tx)
    }

    /// Number of running reader tasks.
    pub fn active_readers(&self) -> usize {
        self.active.count()
    }

    /// Wait until every reader task has exited. Returns `false` on timeout.
    pub fn wait_for_readers(&self, timeout: Duration) -> bool {
        self.active.wait_idle(timeout)
    }

    /// Connections with at least one side not yet saved.
    pub fn unsaved(&self) -> Vec<Arc<TcpConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.is_saved())
            .cloned()
            .collect()
    }

    /// Forget fully saved connections. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|c| !c.is_saved());
        before - connections.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl StreamFactory for ConnectionFactory {
    fn new_stream(&self, flow: FlowIdent, segment: &TcpSegment) -> Arc<dyn ReassemblyStream> {
        self.create(flow, segment.timestamp_us)
    }
}
