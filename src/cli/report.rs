//! `report` commands: latest snapshot and occupancy over the stored history.
//!
//! Output is plain tab-separated rows; prettier rendering belongs to
//! whatever consumes it.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use clap::{Args, Subcommand};

use crate::config::Settings;
use crate::report::{
    latest_snapshot, occupancy_over_store, sort_groups, OccupancyOptions, ReportSession,
    SnapshotGroup,
};
use crate::storage::{GpuFilter, SnapshotStore};

/// Reporting subcommands
#[derive(Subcommand)]
pub enum ReportCommands {
    /// Cross-sectional utilization of the most recent poll cycle
    Latest(LatestArgs),
    /// Per-offer time-weighted occupancy over a window
    Occupancy(OccupancyArgs),
    /// Both reports in sequence
    Both(BothArgs),
}

/// Arguments for the latest-snapshot report
#[derive(Args)]
pub struct LatestArgs {
    /// Column to sort by; prefix with '+' for ascending, '-' for descending
    #[arg(long, default_value = "-util_pct_api")]
    pub sort: String,
    /// Print separate tables for verified and non-verified providers
    #[arg(long)]
    pub split_verified: bool,
    /// Include only offers whose GPU name contains any of these substrings
    /// (repeat or comma separated)
    #[arg(long = "gpu-name")]
    pub gpu_names: Vec<String>,
    /// Include only offers with these GPU counts per machine (repeat or
    /// comma separated)
    #[arg(long = "gpu-count")]
    pub gpu_counts: Vec<String>,
}

/// Arguments for the occupancy report
#[derive(Args)]
pub struct OccupancyArgs {
    /// Start of the occupancy window (ISO8601 UTC)
    #[arg(long)]
    pub since: Option<String>,
    /// End of the occupancy window (ISO8601 UTC)
    #[arg(long)]
    pub until: Option<String>,
    /// Minimum snapshots per offer
    #[arg(long, default_value_t = 2)]
    pub min_samples: u32,
    /// Minimum sampled minutes per offer
    #[arg(long, default_value_t = 0.0)]
    pub min_total_minutes: f64,
    /// Trim occupancy output to N rows
    #[arg(long)]
    pub limit: Option<usize>,
}

/// Arguments for running both reports
#[derive(Args)]
pub struct BothArgs {
    #[command(flatten)]
    pub occupancy: OccupancyArgs,
    #[command(flatten)]
    pub latest: LatestArgs,
}

pub async fn execute(command: ReportCommands) -> Result<()> {
    let settings = Settings::load()?;
    let store = SnapshotStore::from_settings(&settings.database).await?;
    store.ensure_schema().await?;
    let mut session = ReportSession::new();

    match command {
        ReportCommands::Latest(args) => {
            run_latest(&store, &args, &mut session).await?;
        }
        ReportCommands::Occupancy(args) => {
            run_occupancy(&store, &settings, &args, &mut session).await?;
        }
        ReportCommands::Both(args) => {
            run_occupancy(&store, &settings, &args.occupancy, &mut session).await?;
            println!();
            run_latest(&store, &args.latest, &mut session).await?;
        }
    }
    Ok(())
}

async fn run_latest(
    store: &SnapshotStore,
    args: &LatestArgs,
    session: &mut ReportSession,
) -> Result<()> {
    if let Some(note) = session.assumption_note() {
        println!("{note}");
    }

    if args.split_verified {
        let verified = GpuFilter::from_tokens(&args.gpu_names, &args.gpu_counts, Some(true));
        print_latest_table(store, &verified, &args.sort, Some("Verified providers")).await?;
        println!();
        let unverified = GpuFilter::from_tokens(&args.gpu_names, &args.gpu_counts, Some(false));
        print_latest_table(
            store,
            &unverified,
            &args.sort,
            Some("Unverified+deverified providers"),
        )
        .await?;
    } else {
        let filter = GpuFilter::from_tokens(&args.gpu_names, &args.gpu_counts, None);
        print_latest_table(store, &filter, &args.sort, None).await?;
    }
    Ok(())
}

const LATEST_HEADERS: &[&str] = &[
    "util_rank",
    "gpu_name",
    "gpus",
    "offers_total",
    "offers_avail",
    "offers_util_assumed",
    "offers_util_api",
    "offers_unflagged",
    "offers_rentable_unknown",
    "util_pct_assumed",
    "util_pct_api",
    "price_avail_avg",
    "price_util_avg",
    "price_per_gpu",
    "verified",
    "deverified",
    "time_pct_assumed",
    "time_pct_api",
    "occupancy_samples",
];

async fn print_latest_table(
    store: &SnapshotStore,
    filter: &GpuFilter,
    sort: &str,
    title: Option<&str>,
) -> Result<()> {
    let mut groups = latest_snapshot(store, filter).await?;
    sort_groups(&mut groups, sort);

    if let Some(title) = title {
        println!("{title}");
    }
    println!("{}", LATEST_HEADERS.join("\t"));
    for group in &groups {
        println!("{}", format_group(group));
    }
    Ok(())
}

fn format_group(group: &SnapshotGroup) -> String {
    [
        group.rank.to_string(),
        group.gpu_name.clone().unwrap_or_default(),
        group.gpus.clone(),
        group.total.to_string(),
        group.available.to_string(),
        group.assumed_utilized.to_string(),
        group.api_rented.to_string(),
        group.unflagged.to_string(),
        group.rentable_unknown.to_string(),
        group.assumed_utilization_pct.to_string(),
        group.api_rented_pct.to_string(),
        opt_to_string(group.avg_price_available),
        opt_to_string(group.avg_price_utilized),
        opt_to_string(group.price_per_gpu),
        group.verified.to_string(),
        group.deverified.to_string(),
        group.time_pct_assumed.to_string(),
        group.time_pct_api.to_string(),
        group.occupancy_samples.to_string(),
    ]
    .join("\t")
}

const OCCUPANCY_HEADERS: &[&str] = &[
    "offer_id",
    "machine_id",
    "gpu_name",
    "samples",
    "total_hours",
    "available_hours",
    "assumed_rented_hours",
    "api_rented_hours",
    "unknown_hours",
    "available_pct",
    "assumed_rented_pct",
    "api_rented_pct",
    "unknown_pct",
];

async fn run_occupancy(
    store: &SnapshotStore,
    settings: &Settings,
    args: &OccupancyArgs,
    session: &mut ReportSession,
) -> Result<()> {
    let since = args.since.as_deref().map(parse_time_arg).transpose()?;
    let until = args.until.as_deref().map(parse_time_arg).transpose()?;

    let opts = OccupancyOptions {
        poll_interval: settings.collector.effective_poll_interval(),
        min_samples: args.min_samples,
        min_total_minutes: args.min_total_minutes,
        limit: args.limit,
    };
    let summaries = occupancy_over_store(store, since, until, &opts).await?;

    if let Some(note) = session.assumption_note() {
        println!("{note}");
    }
    println!("{}", OCCUPANCY_HEADERS.join("\t"));
    for entry in &summaries {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            entry.offer_id,
            entry.machine_id,
            entry.gpu_name.clone().unwrap_or_default(),
            entry.samples,
            entry.total_hours,
            entry.available_hours,
            entry.assumed_rented_hours,
            entry.api_rented_hours,
            entry.unknown_hours,
            entry.available_pct,
            entry.assumed_rented_pct,
            entry.api_rented_pct,
            entry.unknown_pct,
        );
    }
    Ok(())
}

fn opt_to_string(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Accept RFC3339, `YYYY-MM-DDTHH:MM:SS` (assumed UTC), or a bare date.
fn parse_time_arg(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
    }
    bail!("unrecognized timestamp {trimmed:?} (expected ISO8601 UTC)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_args_accept_common_iso_forms() {
        let full = parse_time_arg("2026-05-01T12:30:00Z").unwrap();
        assert_eq!(full, Utc.with_ymd_and_hms(2026, 5, 1, 12, 30, 0).unwrap());

        let naive = parse_time_arg("2026-05-01T12:30:00").unwrap();
        assert_eq!(naive, full);

        let date = parse_time_arg("2026-05-01").unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap());

        assert!(parse_time_arg("yesterday").is_err());
    }
}
