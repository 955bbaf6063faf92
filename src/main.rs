//! pcapstream CLI entry point.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pcapstream::cli::{Args, SummaryFormatter};
use pcapstream::context::PipelineContext;
use pcapstream::decoder::builtin_decoders;
use pcapstream::pcap::PcapReader;
use pcapstream::pipeline::Pipeline;
use pcapstream::writer::FileWriter;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();

    // Handle info-only commands
    if args.is_info_only() {
        list_decoders();
        return Ok(());
    }

    let capture = args
        .file
        .as_ref()
        .context("Capture file required. Use --help for usage.")?;

    // Everything that can fail fatally happens before the first packet
    let mut builder = PipelineContext::builder(args.to_config());
    if let Some(out) = &args.out {
        let writer = FileWriter::create(out)
            .with_context(|| format!("Failed to prepare output directory: {}", out.display()))?;
        builder = builder.writer(Arc::new(writer));
    }
    let ctx = builder.build().context("Invalid pipeline configuration")?;

    let mut reader = PcapReader::open(capture)
        .with_context(|| format!("Failed to open capture file: {}", capture.display()))?;
    let pipeline = Pipeline::new(Arc::clone(&ctx)).context("Failed to start packet workers")?;

    loop {
        match reader.next_packet() {
            Ok(Some(packet)) => {
                if let Err(e) = pipeline.submit(packet) {
                    tracing::warn!(error = %e, "packet submission stopped");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(frame = reader.frame_count(), error = %e, "stopped reading capture");
                ctx.record_error(&e.to_string());
                break;
            }
        }
    }
    tracing::info!(frames = reader.frame_count(), "capture exhausted");

    let summary = pipeline.drain();
    SummaryFormatter::new(args.format).write(&summary, &mut io::stdout())?;
    Ok(())
}

fn list_decoders() {
    println!("Available Stream Decoders:");
    println!("{:-<60}", "");

    for decoder in builtin_decoders() {
        let ports: Vec<String> = decoder.ports().iter().map(u16::to_string).collect();
        println!(
            "  {:<8} {:<5} ports: {:<16} {}",
            decoder.name(),
            decoder.transport().as_str(),
            if ports.is_empty() { "-".to_string() } else { ports.join(",") },
            decoder.description()
        );
    }
}
