//! Time-weighted occupancy aggregation
//!
//! Converts each offer's sparse sequence of point-in-time observations into
//! continuous-time duration estimates. The state observed at sample `i` is
//! assumed to hold until sample `i+1` (right-open interval, last observation
//! carried forward); the final sample of an offer is extrapolated forward by
//! one poll interval.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::client::BACKOFF_BASE_SECS;
use crate::report::{round_to, ReportError, ReportResult};
use crate::storage::{SampleRow, SnapshotStore};

/// Aggregation knobs.
#[derive(Debug, Clone)]
pub struct OccupancyOptions {
    /// Polling cadence used for gap/tail extrapolation.
    pub poll_interval: Duration,
    /// Minimum samples an offer needs to appear in the result.
    pub min_samples: u32,
    /// Minimum accrued minutes an offer needs to appear in the result.
    pub min_total_minutes: f64,
    /// Optional row cap applied after sorting.
    pub limit: Option<usize>,
}

impl Default for OccupancyOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(BACKOFF_BASE_SECS),
            min_samples: 2,
            min_total_minutes: 0.0,
            limit: None,
        }
    }
}

/// Per-offer time-weighted summary.
///
/// `assumed_rented` (rentable=0) and `api_rented` (rented=1) measure two
/// different signals of the same underlying concept and may diverge;
/// `api_rented` overlaps the rentable-based buckets, so only
/// `available + assumed_rented + unknown` partitions the total.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferOccupancy {
    pub offer_id: i64,
    pub machine_id: i64,
    pub gpu_name: Option<String>,
    pub samples: u32,
    pub total_hours: f64,
    pub available_hours: f64,
    pub assumed_rented_hours: f64,
    pub api_rented_hours: f64,
    pub unknown_hours: f64,
    pub available_pct: f64,
    pub assumed_rented_pct: f64,
    pub api_rented_pct: f64,
    pub unknown_pct: f64,
}

#[derive(Debug, Default)]
struct Accumulator {
    machine_id: i64,
    gpu_name: Option<String>,
    samples: u32,
    total_sec: f64,
    available_sec: f64,
    assumed_rented_sec: f64,
    api_rented_sec: f64,
    unknown_sec: f64,
}

/// Aggregate ordered samples into per-offer occupancy summaries.
///
/// `rows` must be sorted by `(offer_id, ts)` ascending, as returned by
/// [`SnapshotStore::select_range`]. Sample counting and duration accrual are
/// independent: a sample whose interval is clipped to nothing still counts
/// toward its offer's sample total.
pub fn occupancy(
    rows: &[SampleRow],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    opts: &OccupancyOptions,
) -> ReportResult<Vec<OfferOccupancy>> {
    if until <= since {
        return Err(ReportError::InvertedWindow);
    }

    let tail = ChronoDuration::seconds(opts.poll_interval.as_secs() as i64);
    let mut stats: BTreeMap<i64, Accumulator> = BTreeMap::new();

    for (idx, row) in rows.iter().enumerate() {
        let entry = stats.entry(row.offer_id).or_insert_with(|| Accumulator {
            machine_id: row.machine_id,
            gpu_name: row.gpu_name.clone(),
            ..Accumulator::default()
        });
        entry.samples += 1;

        let next_ts = match rows.get(idx + 1) {
            Some(next) if next.offer_id == row.offer_id => next.ts,
            _ => row.ts + tail,
        };

        // Clip to the window; intervals entirely outside it accrue nothing.
        let end = next_ts.min(until);
        let start = row.ts.max(since);
        let delta_sec = (end - start).num_seconds() as f64;
        if delta_sec <= 0.0 {
            continue;
        }

        entry.total_sec += delta_sec;
        match row.rentable {
            Some(flag) if flag != 0 => entry.available_sec += delta_sec,
            Some(_) => entry.assumed_rented_sec += delta_sec,
            None => entry.unknown_sec += delta_sec,
        }
        if row.rented.is_some_and(|flag| flag != 0) {
            entry.api_rented_sec += delta_sec;
        }
    }

    let min_total_sec = (opts.min_total_minutes * 60.0).max(0.0);
    let min_samples = opts.min_samples.max(1);

    let mut summaries: Vec<OfferOccupancy> = stats
        .into_iter()
        .filter(|(_, acc)| {
            acc.samples >= min_samples && acc.total_sec >= min_total_sec && acc.total_sec > 0.0
        })
        .map(|(offer_id, acc)| OfferOccupancy {
            offer_id,
            machine_id: acc.machine_id,
            gpu_name: acc.gpu_name,
            samples: acc.samples,
            total_hours: round_to(acc.total_sec / 3600.0, 3),
            available_hours: round_to(acc.available_sec / 3600.0, 3),
            assumed_rented_hours: round_to(acc.assumed_rented_sec / 3600.0, 3),
            api_rented_hours: round_to(acc.api_rented_sec / 3600.0, 3),
            unknown_hours: round_to(acc.unknown_sec / 3600.0, 3),
            available_pct: round_to(100.0 * acc.available_sec / acc.total_sec, 2),
            assumed_rented_pct: round_to(100.0 * acc.assumed_rented_sec / acc.total_sec, 2),
            api_rented_pct: round_to(100.0 * acc.api_rented_sec / acc.total_sec, 2),
            unknown_pct: round_to(100.0 * acc.unknown_sec / acc.total_sec, 2),
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.assumed_rented_pct
            .total_cmp(&a.assumed_rented_pct)
            .then(b.api_rented_hours.total_cmp(&a.api_rented_hours))
    });
    if let Some(limit) = opts.limit {
        summaries.truncate(limit);
    }

    Ok(summaries)
}

/// Run the occupancy report against the store, defaulting the window to the
/// stored timestamp bounds (with the upper bound extended by one poll
/// interval so the final cycle gets its extrapolated tail).
pub async fn occupancy_over_store(
    store: &SnapshotStore,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    opts: &OccupancyOptions,
) -> ReportResult<Vec<OfferOccupancy>> {
    let Some((min_ts, max_ts)) = store.ts_bounds().await? else {
        return Ok(Vec::new());
    };

    let tail = ChronoDuration::seconds(opts.poll_interval.as_secs() as i64);
    let since = since.unwrap_or(min_ts);
    let until = until.unwrap_or(max_ts + tail);
    if until <= since {
        return Err(ReportError::InvertedWindow);
    }

    let rows = store.select_range(since, until).await?;
    occupancy(&rows, since, until, opts)
}
