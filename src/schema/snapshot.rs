//! Canonical snapshot record
//!
//! One `OfferSnapshot` is produced per (raw offer, poll cycle) and appended
//! to the store. Records are immutable once written; rows sharing an
//! `offer_id` across timestamps form that offer's time series.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used for every persisted `ts` value (second precision, UTC).
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format a timestamp the way it is persisted.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a persisted timestamp back into a `DateTime<Utc>`.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Availability of an offer at sample time.
///
/// Either taken verbatim from the query partition that produced the row, or
/// derived from the coerced `rentable`/`rented` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityState {
    Available,
    Rented,
    Unavailable,
    Unknown,
}

impl AvailabilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityState::Available => "available",
            AvailabilityState::Rented => "rented",
            AvailabilityState::Unavailable => "unavailable",
            AvailabilityState::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "available" => Some(AvailabilityState::Available),
            "rented" => Some(AvailabilityState::Rented),
            "unavailable" => Some(AvailabilityState::Unavailable),
            "unknown" => Some(AvailabilityState::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical offer snapshot, the unit persisted by the collector.
///
/// Tri-state flags (`rentable`, `rented`) are encoded as `Some(0)`/`Some(1)`/
/// `None` so that "the upstream did not say" survives into the analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferSnapshot {
    /// Poll-cycle timestamp; identical across all rows of one cycle.
    pub ts: DateTime<Utc>,
    /// Rentable unit identifier.
    pub offer_id: i64,
    /// Physical host backing the offer; many offers may share a machine.
    pub machine_id: i64,
    pub gpu_name: Option<String>,
    pub num_gpus: i64,
    pub gpu_frac: Option<f64>,
    /// Total GPU RAM in GB, normalized from whatever unit the source used.
    pub gpu_total_ram_gb: Option<f64>,
    pub dph_total_usd: Option<f64>,
    pub reliability2: Option<f64>,
    pub geolocation: Option<String>,
    pub offer_type: Option<String>,
    pub rentable: Option<i64>,
    pub rented: Option<i64>,
    pub verified: i64,
    pub deverified: i64,
    pub availability_state: AvailabilityState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ts_roundtrip_is_second_precision() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        let formatted = format_ts(ts);
        assert_eq!(formatted, "2026-03-14T15:09:26Z");
        assert_eq!(parse_ts(&formatted), Some(ts));
    }

    #[test]
    fn availability_state_parses_canonical_forms() {
        assert_eq!(
            AvailabilityState::parse("Rented"),
            Some(AvailabilityState::Rented)
        );
        assert_eq!(AvailabilityState::parse("offline"), None);
    }
}
