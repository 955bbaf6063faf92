//! Pipeline configuration.

use std::time::Duration;

use crate::error::SetupError;

/// Tunables for the packet-to-conversation pipeline.
///
/// Defaults favour capturing as much as possible from lossy captures: the
/// state machine and option checks only warn, and ranges with missing
/// leading bytes are still delivered.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of packet dispatcher workers.
    pub workers: usize,
    /// Bound of each worker's inbound packet channel.
    pub packet_buffer: usize,
    /// Bound of each stream reader's inbound channel.
    pub stream_buffer: usize,
    /// Runtime threads shared by every stream reader task.
    pub reader_threads: usize,
    /// Ceiling of the drain worker pool.
    pub num_stream_workers: usize,
    /// Bound of each drain worker's queue.
    pub stream_processor_buffer: usize,
    /// Maximum number of leading server bytes kept as a service banner.
    pub banner_size: usize,

    /// Accept segments the TCP state machine rejects.
    pub ignore_fsm_err: bool,
    /// Accept segments the option checker rejects.
    pub no_opt_check: bool,
    /// Reject segments with an invalid TCP checksum.
    pub checksum: bool,
    /// Keep byte ranges that follow missing data.
    pub allow_missing_init: bool,
    /// Evict a connection from the engine once it completes.
    pub remove_closed_streams: bool,
    /// Hand merged conversations to the writer.
    pub save_conversations: bool,

    /// Packets per worker between periodic flushes; zero disables.
    pub flush_every: usize,
    /// Pending out-of-order data older than this is force-delivered.
    pub close_pending_timeout: Duration,
    /// Connections idle longer than this are closed.
    pub close_inactive_timeout: Duration,

    /// Per-worker shutdown acknowledgement bound.
    pub worker_ack_timeout: Duration,
    /// Bound used by `submit_timeout`.
    pub submit_timeout: Duration,
    /// Bound on a worker waiting for earlier packets to be queued before
    /// its own. On expiry the packet is queued out of order.
    pub ordering_timeout: Duration,
    /// Bound on waiting for stream readers during drain.
    pub reassembly_timeout: Duration,
    /// Bound on a single connection's readers draining at completion.
    pub stream_drain_timeout: Duration,

    /// Only these decoders are registered when non-empty.
    pub include_decoders: Vec<String>,
    /// These decoders are never registered.
    pub exclude_decoders: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            workers: cpus,
            packet_buffer: 100,
            stream_buffer: 100,
            reader_threads: cpus,
            num_stream_workers: cpus,
            stream_processor_buffer: 100,
            banner_size: 512,
            ignore_fsm_err: true,
            no_opt_check: true,
            checksum: false,
            allow_missing_init: true,
            remove_closed_streams: true,
            save_conversations: true,
            flush_every: 100,
            close_pending_timeout: Duration::from_secs(5),
            close_inactive_timeout: Duration::from_secs(24 * 60 * 60),
            worker_ack_timeout: Duration::from_secs(3),
            submit_timeout: Duration::from_secs(3),
            ordering_timeout: Duration::from_secs(5),
            reassembly_timeout: Duration::from_secs(5),
            stream_drain_timeout: Duration::from_secs(1),
            include_decoders: Vec::new(),
            exclude_decoders: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Check that every pool size and channel bound is usable.
    pub fn validate(&self) -> Result<(), SetupError> {
        let nonzero = [
            ("workers", self.workers),
            ("packet_buffer", self.packet_buffer),
            ("stream_buffer", self.stream_buffer),
            ("reader_threads", self.reader_threads),
            ("num_stream_workers", self.num_stream_workers),
            ("stream_processor_buffer", self.stream_processor_buffer),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(SetupError::InvalidConfig {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    /// Pending-data age threshold in capture microseconds.
    pub(crate) fn close_pending_us(&self) -> i64 {
        duration_us(self.close_pending_timeout)
    }

    /// Inactivity threshold in capture microseconds.
    pub(crate) fn close_inactive_us(&self) -> i64 {
        duration_us(self.close_inactive_timeout)
    }
}

fn duration_us(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_forgiving() {
        let config = PipelineConfig::default();
        assert!(config.ignore_fsm_err);
        assert!(config.no_opt_check);
        assert!(config.allow_missing_init);
        assert!(!config.checksum);
        assert_eq!(config.banner_size, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = PipelineConfig {
            workers: 0,
            ..Default::default()
        };
        match config.validate() {
            Err(SetupError::InvalidConfig { field, .. }) => assert_eq!(field, "workers"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_timeouts_in_micros() {
        let config = PipelineConfig {
            close_pending_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        assert_eq!(config.close_pending_us(), 1_500_000);
    }
}
