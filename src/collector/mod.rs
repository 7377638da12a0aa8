//! Poll loop
//!
//! Drives fetch → normalize → append on a fixed cadence. One cycle queries
//! the three partitions in a fixed order (available, rented, unavailable)
//! and writes every row with one shared timestamp, so readers can treat all
//! rows of a cycle as a single logical sample. Strictly sequential: the loop
//! blocks through each call and each backoff sleep, which keeps writers
//! single and stays inside the upstream's rate limits.

use chrono::{DateTime, SubsecRound, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::client::retry::{BACKOFF_BASE_SECS, BACKOFF_CAP_SECS};
use crate::client::{ClientError, OfferSource};
use crate::schema::{format_ts, normalize, AvailabilityState, OfferSnapshot};
use crate::storage::{SnapshotStore, StoreError};

/// Errors escaping one poll cycle; absorbed by the loop's outer handler.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one successful poll cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleStats {
    pub ts: DateTime<Utc>,
    pub available: usize,
    pub rented: usize,
    pub unavailable: usize,
}

impl CycleStats {
    pub fn total(&self) -> usize {
        self.available + self.rented + self.unavailable
    }
}

/// The collection service: one source, one store, one cadence.
pub struct Collector<S: OfferSource> {
    source: S,
    store: SnapshotStore,
    poll_interval: Duration,
}

impl<S: OfferSource> Collector<S> {
    pub fn new(source: S, store: SnapshotStore, poll_interval: Duration) -> Self {
        Self {
            source,
            store,
            poll_interval,
        }
    }

    /// Run one fetch-normalize-append cycle. All rows share the cycle's
    /// second-precision timestamp.
    pub async fn run_cycle(&self) -> Result<CycleStats, CycleError> {
        let ts = Utc::now().trunc_subsecs(0);

        let available = self.source.search_offers(false, Some(true)).await?;
        // Rented offers are queried without a rentable filter: rentable=false
        // would widen the result to every non-rentable offer.
        let rented = self.source.search_offers(true, None).await?;
        let unavailable = self.source.search_offers(false, Some(false)).await?;
        info!(
            available = available.len(),
            rented = rented.len(),
            unavailable = unavailable.len(),
            "fetched marketplace offers"
        );

        let stats = CycleStats {
            ts,
            available: available.len(),
            rented: rented.len(),
            unavailable: unavailable.len(),
        };

        let rows: Vec<OfferSnapshot> = available
            .iter()
            .map(|offer| normalize(offer, ts, Some(AvailabilityState::Available)))
            .chain(
                rented
                    .iter()
                    .map(|offer| normalize(offer, ts, Some(AvailabilityState::Rented))),
            )
            .chain(
                unavailable
                    .iter()
                    .map(|offer| normalize(offer, ts, Some(AvailabilityState::Unavailable))),
            )
            .collect();

        let inserted = self.store.insert_snapshots(&rows).await?;
        info!(rows = inserted, ts = %format_ts(ts), "appended poll cycle");
        Ok(stats)
    }

    /// Poll until the process is terminated. Any error escaping a cycle
    /// (retries exhausted or a structural mismatch) triggers a loop-level
    /// backoff and polling resumes; the service never exits on upstream
    /// flakiness.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "collector started"
        );
        let mut backoff_attempt = 0u32;
        loop {
            info!("polling marketplace offers (available + rented + unavailable)");
            match self.run_cycle().await {
                Ok(_) => {
                    backoff_attempt = 0;
                    sleep(self.poll_interval).await;
                }
                Err(err) => {
                    backoff_attempt += 1;
                    let delay_secs =
                        (BACKOFF_BASE_SECS * u64::from(backoff_attempt.max(1))).min(BACKOFF_CAP_SECS);
                    warn!(
                        error = %err,
                        backoff_attempt,
                        delay_secs,
                        "poll cycle failed, backing off"
                    );
                    sleep(Duration::from_secs(delay_secs)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientResult;
    use crate::schema::RawOffer;
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Scripted source: one canned payload per partition.
    struct ScriptedSource;

    fn offer(id: i64) -> RawOffer {
        json!({ "id": id, "machine_id": id, "gpu_name": "RTX 4090", "num_gpus": 1 })
            .as_object()
            .unwrap()
            .clone()
    }

    #[async_trait]
    impl OfferSource for ScriptedSource {
        async fn search_offers(
            &self,
            rented: bool,
            rentable: Option<bool>,
        ) -> ClientResult<Vec<RawOffer>> {
            Ok(match (rented, rentable) {
                (false, Some(true)) => vec![offer(1), offer(2)],
                (true, None) => vec![offer(3)],
                (false, Some(false)) => vec![offer(4)],
                _ => vec![],
            })
        }
    }

    async fn memory_store() -> SnapshotStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SnapshotStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn cycle_writes_all_partitions_under_one_timestamp() {
        let collector = Collector::new(
            ScriptedSource,
            memory_store().await,
            Duration::from_secs(360),
        );

        let stats = collector.run_cycle().await.unwrap();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.rented, 1);
        assert_eq!(stats.unavailable, 1);
        assert_eq!(stats.total(), 4);

        let rows = collector
            .store
            .select_range(stats.ts, stats.ts)
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|row| row.ts == stats.ts));

        let state_of = |offer_id: i64| {
            rows.iter()
                .find(|row| row.offer_id == offer_id)
                .and_then(|row| row.availability_state.clone())
                .unwrap()
        };
        assert_eq!(state_of(1), "available");
        assert_eq!(state_of(3), "rented");
        assert_eq!(state_of(4), "unavailable");
    }
}
