//! Command-line interface
//!
//! Thin surface over the collector and the reporting queries.

pub mod collect;
pub mod report;

use clap::{Parser, Subcommand};

/// offerwatch CLI
#[derive(Parser)]
#[command(name = "offerwatch")]
#[command(about = "GPU rental marketplace monitor and utilization reporter")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the collection service (poll, normalize, append)
    Collect(collect::CollectArgs),
    /// Reporting queries over the collected history
    #[command(subcommand)]
    Report(report::ReportCommands),
}
