//! Output formatting for the pipeline summary.

use std::io::Write;

use clap::ValueEnum;

use crate::pipeline::Summary;

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed tables (default)
    Table,
    /// A single JSON object
    Json,
}

/// Formats the summary for output.
pub struct SummaryFormatter {
    format: OutputFormat,
}

impl SummaryFormatter {
    /// Create a new formatter with the specified format.
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn write<W: Write>(&self, summary: &Summary, writer: &mut W) -> std::io::Result<()> {
        match self.format {
            OutputFormat::Table => write!(writer, "{summary}"),
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut *writer, summary)?;
                writeln!(writer)
            }
        }
    }
}
