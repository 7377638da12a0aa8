//! offerwatch CLI
//!
//! Provides commands for:
//! - `collect`: run the marketplace poll loop
//! - `report`: utilization reports over the collected history

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offerwatch::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("offerwatch=info".parse()?))
        .init();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Execute command
    match cli.command {
        Commands::Collect(args) => {
            offerwatch::cli::collect::execute(args).await?;
        }
        Commands::Report(command) => {
            offerwatch::cli::report::execute(command).await?;
        }
    }

    Ok(())
}
