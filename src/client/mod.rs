//! Marketplace client
//!
//! Issues "search offers" queries against the upstream marketplace with a
//! retry/backoff policy, and classifies failures into retryable and fatal
//! variants. The [`OfferSource`] trait is the seam the collector polls
//! through, so tests can substitute a scripted source.

pub mod error;
pub mod market;
pub mod query;
pub mod retry;

pub use error::{ClientError, ClientResult};
pub use market::{MarketClient, OfferSource};
pub use query::build_search_query;
pub use retry::{fetch_with_retry, RetryPolicy, BACKOFF_BASE_SECS, MIN_POLL_INTERVAL_SECS};
