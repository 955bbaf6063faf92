//! Error types for pcapstream.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for pcapstream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading or parsing a capture file
    #[error("PCAP error: {0}")]
    Pcap(#[from] PcapError),

    /// Error during layer parsing
    #[error("Protocol parse error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Setup failure; aborts before any packet is processed
    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),

    /// Error raised by the running pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Error raised by a stream decoder
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to capture file reading.
#[derive(Error, Debug)]
pub enum PcapError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid PCAP format
    #[error("Invalid PCAP format: {reason}")]
    InvalidFormat { reason: String },

    /// Unsupported link type
    #[error("Unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: u16 },
}

/// Errors related to layer parsing.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Packet too short for protocol header
    #[error("{protocol}: packet too short (need {needed} bytes, have {have})")]
    PacketTooShort {
        protocol: &'static str,
        needed: usize,
        have: usize,
    },

    /// Header could not be sliced
    #[error("{protocol}: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },

    /// Link layer this crate cannot slice
    #[error("unsupported link type {0}")]
    UnsupportedLink(u16),
}

/// Fatal configuration and output errors.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Output directory could not be created
    #[error("cannot create output directory {path}: {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output file could not be created
    #[error("cannot create output file {path}: {source}")]
    OutputFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration value out of range
    #[error("invalid configuration: {field} {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    /// Include/exclude list names a decoder that does not exist
    #[error("unknown decoder '{name}'")]
    UnknownDecoder { name: String },

    /// Stream reader runtime could not be started
    #[error("cannot start stream reader runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// Decoder initialization hook failed
    #[error("decoder {name} failed to initialize: {reason}")]
    DecoderInit { name: &'static str, reason: String },
}

/// Errors surfaced by the packet dispatcher.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Ingestion has been stopped by the drain protocol
    #[error("pipeline is no longer accepting packets")]
    Stopped,

    /// A worker did not accept the packet in time
    #[error("worker {worker} did not accept packet within {timeout_ms}ms")]
    SubmitTimeout { worker: usize, timeout_ms: u128 },

    /// A worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors raised by application decoders.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Data did not follow the protocol
    #[error("{decoder}: malformed data: {reason}")]
    Malformed {
        decoder: &'static str,
        reason: String,
    },

    /// Conversation ended mid-message
    #[error("{decoder}: truncated message")]
    Truncated { decoder: &'static str },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
