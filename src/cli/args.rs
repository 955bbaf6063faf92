//! Command-line argument definitions.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use super::OutputFormat;
use crate::config::PipelineConfig;

/// Reassemble TCP conversations and UDP pseudo-streams from a capture file
/// and decode them.
#[derive(Parser, Debug)]
#[command(name = "pcapstream")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture file to read (pcap or pcapng, optionally gzipped)
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Write conversations and decoded records under this directory
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Summary output format
    #[arg(long = "format", value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Packet dispatcher workers (defaults to available parallelism)
    #[arg(long = "workers")]
    pub workers: Option<usize>,

    /// Bound of each worker's packet channel
    #[arg(long = "packet-buffer", default_value = "100")]
    pub packet_buffer: usize,

    /// Bound of each stream reader's channel
    #[arg(long = "stream-buffer", default_value = "100")]
    pub stream_buffer: usize,

    /// Threads running stream reader tasks (defaults to available parallelism)
    #[arg(long = "reader-threads")]
    pub reader_threads: Option<usize>,

    /// Drain pool workers (defaults to available parallelism)
    #[arg(long = "stream-workers")]
    pub stream_workers: Option<usize>,

    /// Maximum server banner size in bytes
    #[arg(long = "banner-size", default_value = "512")]
    pub banner_size: usize,

    /// Packets per worker between periodic flushes (0 disables)
    #[arg(long = "flush-every", default_value = "100")]
    pub flush_every: usize,

    /// Force out pending out-of-order data older than this many seconds
    #[arg(long = "close-pending", value_name = "SECS", default_value = "5")]
    pub close_pending: u64,

    /// Close connections idle for this many seconds
    #[arg(long = "close-inactive", value_name = "SECS", default_value = "86400")]
    pub close_inactive: u64,

    /// Seconds to wait for stream readers during drain
    #[arg(long = "reassembly-timeout", value_name = "SECS", default_value = "5")]
    pub reassembly_timeout: u64,

    /// Reject segments with an invalid TCP checksum
    #[arg(long = "checksum")]
    pub checksum: bool,

    /// Reject segments the TCP state machine does not accept
    #[arg(long = "strict-fsm")]
    pub strict_fsm: bool,

    /// Reject segments with inconsistent TCP options
    #[arg(long = "opt-check")]
    pub opt_check: bool,

    /// Discard data following missing or lost bytes
    #[arg(long = "no-missing-init")]
    pub no_missing_init: bool,

    /// Keep watching connections after they complete
    #[arg(long = "keep-closed")]
    pub keep_closed: bool,

    /// Only run these decoders (comma separated)
    #[arg(long = "include", value_delimiter = ',')]
    pub include: Vec<String>,

    /// Never run these decoders (comma separated)
    #[arg(long = "exclude", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// List available decoders
    #[arg(long = "list-decoders")]
    pub list_decoders: bool,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Check if this is an info-only command (no capture file needed).
    pub fn is_info_only(&self) -> bool {
        self.list_decoders
    }

    /// Pipeline configuration selected by these arguments.
    pub fn to_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            packet_buffer: self.packet_buffer,
            stream_buffer: self.stream_buffer,
            reader_threads: self.reader_threads.unwrap_or(defaults.reader_threads),
            num_stream_workers: self.stream_workers.unwrap_or(defaults.num_stream_workers),
            banner_size: self.banner_size,
            ignore_fsm_err: !self.strict_fsm,
            no_opt_check: !self.opt_check,
            checksum: self.checksum,
            allow_missing_init: !self.no_missing_init,
            remove_closed_streams: !self.keep_closed,
            save_conversations: self.out.is_some(),
            flush_every: self.flush_every,
            close_pending_timeout: Duration::from_secs(self.close_pending),
            close_inactive_timeout: Duration::from_secs(self.close_inactive),
            reassembly_timeout: Duration::from_secs(self.reassembly_timeout),
            include_decoders: self.include.clone(),
            exclude_decoders: self.exclude.clone(),
            ..defaults
        }
    }
}
