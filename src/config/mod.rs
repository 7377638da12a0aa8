//! Configuration
//!
//! Layered settings loading: config files, then environment overrides.

pub mod settings;

pub use settings::{CollectorSettings, DatabaseSettings, Settings, UpstreamSettings};
