//! Raw offer normalization
//!
//! Maps one raw marketplace record into a canonical [`OfferSnapshot`]. Pure
//! and total: missing or unparseable fields become `None`/zero per field,
//! never an error, so one malformed offer can never abort a poll cycle.

use chrono::{DateTime, Utc};

use crate::schema::extract::{
    extract_geolocation, extract_offer_type, extract_vram_gb, first_present, to_count, to_f64,
    to_flag, to_string, RawOffer,
};
use crate::schema::snapshot::{AvailabilityState, OfferSnapshot};

// Candidate source fields per canonical field, in priority order.
const OFFER_ID_SOURCES: &[&str] = &["id", "offer_id"];
const MACHINE_ID_SOURCES: &[&str] = &["machine_id", "machine", "machineID"];
const GPU_NAME_SOURCES: &[&str] = &["gpu_name", "gpu_name_short", "gpu"];
const NUM_GPUS_SOURCES: &[&str] = &["num_gpus", "numgpus", "gpus"];
const GPU_FRAC_SOURCES: &[&str] = &["gpu_frac", "gpu_fraction"];
const PRICE_SOURCES: &[&str] = &["dph_total", "dollars_per_hour", "usd_per_hour"];
const RELIABILITY_SOURCES: &[&str] = &["reliability2", "reliability"];
const VERIFIED_SOURCES: &[&str] = &["verified", "is_verified"];
const DEVERIFIED_SOURCES: &[&str] = &["deverified", "is_vm_deverified"];

/// Normalize one raw offer into a canonical snapshot.
///
/// `source_state` names the query partition that produced the record; when
/// present it wins over any state derived from the offer's own flags.
pub fn normalize(
    raw: &RawOffer,
    ts: DateTime<Utc>,
    source_state: Option<AvailabilityState>,
) -> OfferSnapshot {
    let offer_id = first_present(raw, OFFER_ID_SOURCES)
        .map(to_count)
        .unwrap_or(0);
    let machine_id = first_present(raw, MACHINE_ID_SOURCES)
        .map(to_count)
        .unwrap_or(0);
    let gpu_name = first_present(raw, GPU_NAME_SOURCES).and_then(to_string);
    let num_gpus = first_present(raw, NUM_GPUS_SOURCES)
        .map(to_count)
        .unwrap_or(1);
    let gpu_frac = first_present(raw, GPU_FRAC_SOURCES)
        .and_then(to_f64)
        .or(Some(1.0));
    let dph_total_usd = first_present(raw, PRICE_SOURCES).and_then(to_f64);
    let reliability2 = first_present(raw, RELIABILITY_SOURCES).and_then(to_f64);

    let rentable = raw.get("rentable").and_then(to_flag);
    let rented = raw.get("rented").and_then(to_flag);
    let (verified, deverified) = derive_verification(raw);

    let availability_state = match source_state {
        Some(state) => state,
        None => derive_availability(rentable, rented),
    };

    OfferSnapshot {
        ts,
        offer_id,
        machine_id,
        gpu_name,
        num_gpus,
        gpu_frac,
        gpu_total_ram_gb: extract_vram_gb(raw),
        dph_total_usd,
        reliability2,
        geolocation: extract_geolocation(raw),
        offer_type: extract_offer_type(raw),
        rentable,
        rented,
        verified,
        deverified,
        availability_state,
    }
}

/// Layered verification-state derivation. Later rules override earlier ones:
/// explicit boolean flags first, then the string `verification` field (which
/// sets both flags together), then a not-verified/not-deverified default for
/// anything still unknown.
fn derive_verification(raw: &RawOffer) -> (i64, i64) {
    let mut verified = first_present(raw, VERIFIED_SOURCES).and_then(to_flag);
    let mut deverified = first_present(raw, DEVERIFIED_SOURCES).and_then(to_flag);

    if let Some(label) = raw.get("verification").and_then(to_string) {
        match label.trim().to_ascii_lowercase().as_str() {
            "verified" => {
                verified = Some(1);
                deverified = Some(0);
            }
            "deverified" => {
                deverified = Some(1);
                verified = Some(0);
            }
            _ => {}
        }
    }

    (verified.unwrap_or(0), deverified.unwrap_or(0))
}

fn derive_availability(rentable: Option<i64>, rented: Option<i64>) -> AvailabilityState {
    match (rentable, rented) {
        (Some(1), Some(0)) => AvailabilityState::Available,
        (_, Some(1)) => AvailabilityState::Rented,
        (Some(0), Some(0)) => AvailabilityState::Unavailable,
        _ => AvailabilityState::Unknown,
    }
}
