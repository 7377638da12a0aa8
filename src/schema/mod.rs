//! Canonical data schema
//!
//! Defines the canonical offer snapshot record, the raw upstream payload
//! type, and the normalization pipeline that maps one into the other.

pub mod extract;
pub mod normalize;
pub mod snapshot;

pub use extract::RawOffer;
pub use normalize::normalize;
pub use snapshot::{format_ts, parse_ts, AvailabilityState, OfferSnapshot};
