//! # offerwatch
//!
//! Monitors a GPU rental marketplace by periodically sampling the set of
//! provider offers, recording their state over time, and deriving
//! utilization analytics.
//!
//! ## Architecture
//!
//! The write path is a single sequential poll loop: the [`client`] fetches
//! each query partition with retry/backoff, the [`schema`] layer normalizes
//! the heterogeneous payloads into canonical snapshot rows, and the
//! [`storage`] layer appends them. The [`report`] module holds the read-side
//! queries over the accumulated history: time-weighted per-offer occupancy
//! and the ranked cross-sectional utilization snapshot.

pub mod cli;
pub mod client;
pub mod collector;
pub mod config;
pub mod report;
pub mod schema;
pub mod storage;

// Re-export commonly used types
pub use client::{ClientError, MarketClient, OfferSource, RetryPolicy};
pub use collector::Collector;
pub use config::Settings;
pub use report::{OccupancyOptions, OfferOccupancy, ReportError, ReportSession, SnapshotGroup};
pub use schema::{AvailabilityState, OfferSnapshot, RawOffer};
pub use storage::{GpuFilter, SnapshotStore, StoreError};
