use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::Receiver;

use crate::flow::{Direction, FlowIdent};

use super::DataFragment;

/// Ordered byte range travelling from the delivery callback to a reader.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub data: Bytes,
    pub timestamp_us: i64,
}

#[derive(Debug)]
struct ReaderState {
    is_client: bool,
    fragments: Vec<DataFragment>,
    num_bytes: usize,
    first_packet: Option<i64>,
}

/// Buffer for one direction of a TCP connection.
///
/// A consumer task on the reader runtime drains the reader's bounded
/// channel into an append-only fragment list until the channel is closed.
/// Fragments are tagged with the reader's role at the moment they are
/// appended; a role flip retags everything already stored under the same
/// lock.
#[derive(Debug)]
pub struct StreamReader {
    flow: FlowIdent,
    saved: AtomicBool,
    state: Mutex<ReaderState>,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl StreamReader {
    pub(crate) fn new(flow: FlowIdent, is_client: bool) -> Self {
        Self {
            flow,
            saved: AtomicBool::new(false),
            state: Mutex::new(ReaderState {
                is_client,
                fragments: Vec::new(),
                num_bytes: 0,
                first_packet: None,
            }),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
        }
    }

    /// Consumer task. Completes once every sender is dropped and the
    /// channel is empty. The reader counts as finished as soon as the task
    /// is gone, even if the runtime dropped it before it ran.
    pub(crate) fn consume(
        self: Arc<Self>,
        mut rx: Receiver<Chunk>,
        active: ActiveGuard,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let done = ReaderDone {
            reader: self,
            _active: active,
        };
        async move {
            while let Some(chunk) = rx.recv().await {
                done.reader.append(chunk);
            }
        }
    }

    fn finish(&self) {
        *self.finished.lock() = true;
        self.finished_cv.notify_all();
        tracing::trace!(flow = %self.flow, "stream reader finished");
    }

    fn append(&self, chunk: Chunk) {
        let mut state = self.state.lock();
        let direction = role_direction(state.is_client);
        state.num_bytes += chunk.data.len();
        state.first_packet.get_or_insert(chunk.timestamp_us);
        state
            .fragments
            .push(DataFragment::new(chunk.data, direction, chunk.timestamp_us));
    }

    /// Sender and receiver of the packets this reader sees.
    pub fn flow(&self) -> FlowIdent {
        self.flow
    }

    pub fn is_client(&self) -> bool {
        self.state.lock().is_client
    }

    /// Change role and retag every stored fragment.
    pub(crate) fn set_client(&self, is_client: bool) {
        let mut state = self.state.lock();
        if state.is_client == is_client {
            return;
        }
        state.is_client = is_client;
        let direction = role_direction(is_client);
        state.fragments = state
            .fragments
            .iter()
            .map(|f| f.retagged(direction))
            .collect();
    }

    pub fn saved(&self) -> bool {
        self.saved.load(Ordering::Acquire)
    }

    /// Set the saved flag. Returns `true` only for the call that set it.
    pub(crate) fn mark_saved(&self) -> bool {
        self.saved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn num_bytes(&self) -> usize {
        self.state.lock().num_bytes
    }

    pub fn first_packet(&self) -> Option<i64> {
        self.state.lock().first_packet
    }

    /// Snapshot of the stored fragments.
    pub fn fragments(&self) -> Vec<DataFragment> {
        self.state.lock().fragments.clone()
    }

    /// Up to `limit` leading bytes of this direction.
    pub fn banner(&self, limit: usize) -> Vec<u8> {
        let state = self.state.lock();
        let mut banner = Vec::with_capacity(limit.min(state.num_bytes));
        for fragment in &state.fragments {
            let room = limit - banner.len();
            if room == 0 {
                break;
            }
            let take = room.min(fragment.len());
            banner.extend_from_slice(&fragment.data()[..take]);
        }
        banner
    }

    /// `ip:port` of the endpoint receiving this direction's data.
    pub fn service_ident(&self) -> String {
        self.flow.dst.to_string()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    /// Wait for the consumer task to drain and exit. Returns `false` on
    /// timeout.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock();
        while !*finished {
            if self
                .finished_cv
                .wait_until(&mut finished, deadline)
                .timed_out()
            {
                return *finished;
            }
        }
        true
    }
}

/// Owned by a consumer task; marks its reader finished when dropped.
struct ReaderDone {
    reader: Arc<StreamReader>,
    _active: ActiveGuard,
}

impl Drop for ReaderDone {
    fn drop(&mut self) {
        self.reader.finish();
    }
}

fn role_direction(is_client: bool) -> Direction {
    if is_client {
        Direction::ToServer
    } else {
        Direction::ToClient
    }
}

/// Count of running consumer tasks, waitable with a deadline.
#[derive(Debug, Default)]
pub struct ActiveReaders {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveReaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer; dropping the guard unregisters it.
    pub(crate) fn register(self: &Arc<Self>) -> ActiveGuard {
        *self.count.lock() += 1;
        ActiveGuard {
            active: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until no consumer is running. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Held by a consumer task for its whole lifetime.
#[derive(Debug)]
pub(crate) struct ActiveGuard {
    active: Arc<ActiveReaders>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut count = self.active.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.active.idle.notify_all();
        }
    }
}
