//! Snapshot storage
//!
//! Append-only store of canonical offer snapshots, keyed by
//! `(offer_id, ts)`. Rows are only ever inserted; readers treat all rows
//! sharing one timestamp as a single logical sample.

pub mod filter;
pub mod store;

pub use filter::GpuFilter;
pub use store::{
    RollupRow, SampleRow, SnapshotRow, SnapshotStore, StoreCapabilities, StoreError, StoreResult,
};
