//! Read-side analytics
//!
//! Pure queries over the store's accumulated history: the time-weighted
//! occupancy aggregator and the cross-sectional latest-snapshot reporter.
//! Neither has side effects on the store.

pub mod latest;
pub mod occupancy;

use thiserror::Error;

use crate::storage::StoreError;

pub use latest::{gpu_count_bucket, latest_snapshot, sort_groups, SnapshotGroup};
pub use occupancy::{occupancy, occupancy_over_store, OccupancyOptions, OfferOccupancy};

/// Reporting errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReportError {
    /// Caller configuration error, reported rather than computed around.
    #[error("'since' must be earlier than 'until'")]
    InvertedWindow,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ReportResult<T> = Result<T, ReportError>;

/// Methodology caveat attached to utilization reports.
pub const ASSUMPTION_NOTE: &str = "NOTE: reports treat offers with rentable=0 as utilized. \
     If a host is offline, paused, or under maintenance, utilization will be overstated. \
     API-reported rented counts are shown separately.";

/// Per-session reporting context.
///
/// Carries the "note already shown" flag so the caveat is surfaced once per
/// reporting session without any process-wide mutable state.
#[derive(Debug, Default)]
pub struct ReportSession {
    assumption_noted: bool,
}

impl ReportSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// The methodology note, the first time it is requested in this session.
    pub fn assumption_note(&mut self) -> Option<&'static str> {
        if self.assumption_noted {
            None
        } else {
            self.assumption_noted = true;
            Some(ASSUMPTION_NOTE)
        }
    }
}

/// Round to a fixed number of decimal places, matching the SQL `ROUND`
/// applied by the query-based report variants.
pub(crate) fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}
