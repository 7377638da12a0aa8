//! `collect` command: run the poll loop until terminated.

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::client::MarketClient;
use crate::collector::Collector;
use crate::config::Settings;
use crate::storage::SnapshotStore;

/// Arguments for the collect command
#[derive(Args)]
pub struct CollectArgs {
    /// Override the configured poll interval in seconds
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,
}

pub async fn execute(args: CollectArgs) -> Result<()> {
    let mut settings = Settings::load()?;
    if args.poll_interval_secs.is_some() {
        settings.collector.poll_interval_secs = args.poll_interval_secs;
    }
    settings.validate()?;

    let store = SnapshotStore::from_settings(&settings.database).await?;
    store.ensure_schema().await?;
    info!(url = %settings.database.url, "store initialized");

    if settings.upstream.include_unverified {
        info!("including unverified/deverified offers in polling");
    }

    let client = MarketClient::from_settings(&settings.upstream)?;
    let collector = Collector::new(
        client,
        store,
        settings.collector.effective_poll_interval(),
    );
    collector.run().await;
    Ok(())
}
