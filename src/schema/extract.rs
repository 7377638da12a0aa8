//! Field extraction and coercion helpers
//!
//! The upstream marketplace does not guarantee a stable schema: the same
//! logical field shows up under different names, types, and units depending
//! on the offer. Every canonical field is therefore backed by an explicit
//! ordered list of candidate sources; the first one that yields a value wins.
//! Coercions are total: unparseable input degrades to `None`/zero, never to
//! an error.

use serde_json::Value;

/// A raw offer record as returned by the marketplace: arbitrary keys,
/// heterogeneous value types.
pub type RawOffer = serde_json::Map<String, Value>;

/// First candidate key present with a non-null value.
pub fn first_present<'a>(raw: &'a RawOffer, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find(|value| !value.is_null())
}

/// Best-effort float coercion. Strings are parsed, booleans map to 0/1,
/// anything else is `None`.
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Best-effort integer coercion for count fields. Unparseable input becomes
/// 0 rather than an error.
pub fn to_count(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

/// Tri-state boolean coercion: `Some(1)` / `Some(0)` / `None` (unknown).
///
/// Accepts native booleans, 0/1 numerics, and a fixed token set. Anything
/// else means "the upstream did not say" and stays `None`, not `false`.
pub fn to_flag(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => n.as_f64().map(|f| i64::from(f as i64 != 0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Some(1),
            "0" | "false" | "no" | "n" | "off" => Some(0),
            _ => None,
        },
        _ => None,
    }
}

/// Non-empty string extraction.
pub fn to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Candidate source fields for total GPU RAM, in priority order.
const VRAM_SOURCES: &[&str] = &["gpu_total_ram_gb", "gpu_total_ram", "gpu_ram", "gpu_mem"];

/// Extract total GPU RAM and normalize it to GB.
///
/// The source does not label its unit, so this applies a magnitude
/// heuristic: values above 1,000,000 are treated as bytes, values above 200
/// as MB, the rest as GB already. This is a deliberate, irreversible guess.
pub fn extract_vram_gb(raw: &RawOffer) -> Option<f64> {
    for key in VRAM_SOURCES {
        let Some(value) = raw.get(*key) else {
            continue;
        };
        let Some(amount) = to_f64(value) else {
            continue;
        };
        if amount > 1_000_000.0 {
            return Some(amount / (1024.0 * 1024.0 * 1024.0));
        }
        if amount > 200.0 {
            return Some(amount / 1024.0);
        }
        return Some(amount);
    }
    None
}

/// Source strategies for the geolocation field, in priority order.
enum GeoSource {
    Field(&'static str),
    CityCountry,
}

const GEO_SOURCES: &[GeoSource] = &[
    GeoSource::Field("geolocation"),
    GeoSource::Field("country"),
    GeoSource::Field("region"),
    GeoSource::CityCountry,
];

/// Extract a human-readable location, composing "city, country" when no
/// single field carries one.
pub fn extract_geolocation(raw: &RawOffer) -> Option<String> {
    for source in GEO_SOURCES {
        match source {
            GeoSource::Field(key) => {
                if let Some(geo) = raw.get(*key).and_then(to_string) {
                    return Some(geo);
                }
            }
            GeoSource::CityCountry => {
                let city = raw.get("city").and_then(to_string);
                let country = first_present(raw, &["country_code", "country"]).and_then(to_string);
                let parts: Vec<String> = [city, country].into_iter().flatten().collect();
                if !parts.is_empty() {
                    return Some(parts.join(", "));
                }
            }
        }
    }
    None
}

/// Source strategies for the offer type field, in priority order.
enum TypeSource {
    Field(&'static str),
    InterruptibleFlags,
}

const TYPE_SOURCES: &[TypeSource] = &[
    TypeSource::Field("type"),
    TypeSource::InterruptibleFlags,
];

/// Extract the offer type, mapping interruptible/preemptible booleans to the
/// canonical strings when no explicit type is present.
pub fn extract_offer_type(raw: &RawOffer) -> Option<String> {
    for source in TYPE_SOURCES {
        match source {
            TypeSource::Field(key) => {
                if let Some(t) = raw.get(*key).and_then(to_string) {
                    return Some(t);
                }
            }
            TypeSource::InterruptibleFlags => {
                let flag = first_present(raw, &["interruptible", "preemptible"])
                    .and_then(Value::as_bool);
                match flag {
                    Some(true) => return Some("interruptible".to_string()),
                    Some(false) => return Some("on-demand".to_string()),
                    None => {}
                }
            }
        }
    }
    None
}
