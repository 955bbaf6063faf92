//! pcapstream - turn captured packets into decoded conversations.
//!
//! Packets are fanned out to a fixed pool of dispatcher workers. TCP
//! segments are reassembled into ordered per-direction streams, UDP
//! datagrams are grouped into pseudo-streams, and every finished
//! conversation is handed to exactly one protocol decoder chosen by port
//! and content sniffing.
//!
//! # Example
//!
//! ```no_run
//! use pcapstream::config::PipelineConfig;
//! use pcapstream::context::PipelineContext;
//! use pcapstream::pcap::PcapReader;
//! use pcapstream::pipeline::Pipeline;
//!
//! fn main() -> anyhow::Result<()> {
//!     let ctx = PipelineContext::new(PipelineConfig::default())?;
//!     let pipeline = Pipeline::new(ctx)?;
//!     let mut reader = PcapReader::open("capture.pcap")?;
//!     while let Some(packet) = reader.next_packet()? {
//!         pipeline.submit(packet)?;
//!     }
//!     println!("{}", pipeline.drain());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod context;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod pcap;
pub mod pipeline;
pub mod protocol;
pub mod service;
pub mod stats;
pub mod stream;
pub mod writer;

pub use error::{Error, Result};
