//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap
//! - Summary output (table or JSON)

mod args;
mod output;

pub use args::Args;
pub use output::{OutputFormat, SummaryFormatter};
