//! SQLite-backed snapshot store
//!
//! Append-only: the only write path is a multi-row insert. Schema setup is
//! an idempotent "ensure" step that compares the desired column set against
//! the introspected one and adds whatever is missing, so older databases
//! upgrade in place on first contact.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DatabaseSettings;
use crate::schema::{format_ts, parse_ts, OfferSnapshot};
use crate::storage::filter::GpuFilter;

/// Store errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid stored timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Declared backend capabilities; reporting queries pick their variant from
/// this flag rather than probing with a failing statement.
#[derive(Debug, Clone, Copy)]
pub struct StoreCapabilities {
    pub window_functions: bool,
}

/// One row of the per-offer time series, as read back for the occupancy
/// aggregator. Ordered by `(offer_id, ts)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub offer_id: i64,
    pub machine_id: i64,
    pub gpu_name: Option<String>,
    pub ts: DateTime<Utc>,
    pub rentable: Option<i64>,
    pub rented: Option<i64>,
    pub availability_state: Option<String>,
}

/// One row of the most recent snapshot, as read back for the cross-sectional
/// reporter.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub gpu_name: Option<String>,
    pub num_gpus: i64,
    pub rentable: Option<i64>,
    pub rented: Option<i64>,
    pub dph_total_usd: Option<f64>,
    pub verified: i64,
    pub deverified: i64,
}

/// All-history occupancy rollup per `(gpu_name, bucket)` group.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupRow {
    pub gpu_name: Option<String>,
    pub gpus: String,
    pub samples: i64,
    pub assumed_rented_time_pct: f64,
    pub api_rented_time_pct: f64,
}

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS offers_raw (
    ts TEXT NOT NULL,
    offer_id INTEGER NOT NULL,
    machine_id INTEGER,
    gpu_name TEXT,
    num_gpus INTEGER,
    gpu_frac REAL,
    gpu_total_ram_gb REAL,
    dph_total_usd REAL,
    reliability2 REAL,
    geolocation TEXT,
    type TEXT,
    rentable INTEGER,
    rented INTEGER
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_offers_raw_ts ON offers_raw (ts)",
    "CREATE INDEX IF NOT EXISTS idx_offers_raw_offer_ts ON offers_raw (offer_id, ts)",
];

/// Columns added after the initial schema; `ensure_schema` backfills them
/// into older databases.
const REQUIRED_COLUMNS: &[(&str, &str)] = &[
    ("verified", "INTEGER"),
    ("deverified", "INTEGER"),
    ("availability_state", "TEXT"),
];

const INSERT_COLUMNS: &str = "ts, offer_id, machine_id, gpu_name, num_gpus, gpu_frac, \
     gpu_total_ram_gb, dph_total_usd, reliability2, geolocation, type, rentable, rented, \
     verified, deverified, availability_state";

const BUCKET_EXPR: &str = "CASE \
     WHEN num_gpus BETWEEN 1 AND 10 THEN CAST(num_gpus AS TEXT) || 'x' \
     WHEN num_gpus > 10 THEN '10x+' \
     ELSE 'unknown' END";

/// Append-only snapshot store.
pub struct SnapshotStore {
    pool: SqlitePool,
    batch_size: usize,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            batch_size: 500,
        }
    }

    /// Create a store from settings.
    pub async fn from_settings(settings: &DatabaseSettings) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // SQLite has shipped window functions since 3.25; the bundled driver is
    // well past that.
    pub fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            window_functions: true,
        }
    }

    /// Idempotent schema setup: create the table and indexes, then add any
    /// required column missing from the introspected column set.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        for statement in CREATE_INDEXES {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        let existing: Vec<String> = sqlx::query("PRAGMA table_info(offers_raw)")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for (column, column_type) in REQUIRED_COLUMNS {
            if !existing.iter().any(|name| name == column) {
                info!(column, "adding missing column to offers_raw");
                sqlx::query(&format!(
                    "ALTER TABLE offers_raw ADD COLUMN {column} {column_type}"
                ))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Append a batch of canonical snapshots. No update or delete path
    /// exists on this table.
    pub async fn insert_snapshots(&self, rows: &[OfferSnapshot]) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut total = 0usize;
        for chunk in rows.chunks(self.batch_size) {
            let values = vec!["(?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"; chunk.len()].join(", ");
            let sql = format!("INSERT INTO offers_raw ({INSERT_COLUMNS}) VALUES {values}");

            let mut query = sqlx::query(&sql);
            for row in chunk {
                query = query
                    .bind(format_ts(row.ts))
                    .bind(row.offer_id)
                    .bind(row.machine_id)
                    .bind(row.gpu_name.clone())
                    .bind(row.num_gpus)
                    .bind(row.gpu_frac)
                    .bind(row.gpu_total_ram_gb)
                    .bind(row.dph_total_usd)
                    .bind(row.reliability2)
                    .bind(row.geolocation.clone())
                    .bind(row.offer_type.clone())
                    .bind(row.rentable)
                    .bind(row.rented)
                    .bind(row.verified)
                    .bind(row.deverified)
                    .bind(row.availability_state.as_str());
            }
            let result = query.execute(&self.pool).await?;
            total += result.rows_affected() as usize;
        }

        debug!(rows = total, "appended snapshot rows");
        Ok(total)
    }

    /// Time-series rows within `[since, until]`, ordered by `(offer_id, ts)`.
    pub async fn select_range(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<SampleRow>> {
        let rows = sqlx::query(
            "SELECT offer_id, machine_id, gpu_name, ts, rentable, rented, availability_state \
             FROM offers_raw WHERE ts >= ? AND ts <= ? ORDER BY offer_id, ts",
        )
        .bind(format_ts(since))
        .bind(format_ts(until))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let raw_ts: String = row.get("ts");
                let ts = parse_ts(&raw_ts).ok_or(StoreError::InvalidTimestamp(raw_ts))?;
                Ok(SampleRow {
                    offer_id: row.get("offer_id"),
                    machine_id: row.get::<Option<i64>, _>("machine_id").unwrap_or(0),
                    gpu_name: row.get("gpu_name"),
                    ts,
                    rentable: row.get("rentable"),
                    rented: row.get("rented"),
                    availability_state: row.get("availability_state"),
                })
            })
            .collect()
    }

    /// Rows of the single most recent polling cycle, optionally pre-filtered.
    pub async fn select_latest_rows(&self, filter: &GpuFilter) -> StoreResult<Vec<SnapshotRow>> {
        let mut sql = String::from(
            "SELECT gpu_name, num_gpus, rentable, rented, dph_total_usd, \
             COALESCE(verified, 0) AS verified, COALESCE(deverified, 0) AS deverified \
             FROM offers_raw WHERE ts = (SELECT MAX(ts) FROM offers_raw)",
        );
        if let Some(condition) = filter.sql_condition() {
            sql.push_str(" AND ");
            sql.push_str(&condition);
        }

        let query = filter.bind(sqlx::query(&sql));
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| SnapshotRow {
                gpu_name: row.get("gpu_name"),
                num_gpus: row.get::<Option<i64>, _>("num_gpus").unwrap_or(0),
                rentable: row.get("rentable"),
                rented: row.get("rented"),
                dph_total_usd: row.get("dph_total_usd"),
                verified: row.get("verified"),
                deverified: row.get("deverified"),
            })
            .collect())
    }

    /// All-history time rollup per `(gpu_name, bucket)` group; sample-share
    /// percentages, no window functions required.
    pub async fn select_history_rollup(&self, filter: &GpuFilter) -> StoreResult<Vec<RollupRow>> {
        let mut sql = format!(
            "SELECT gpu_name, {BUCKET_EXPR} AS gpus, COUNT(*) AS samples, \
             ROUND(AVG(CASE WHEN rentable = 0 THEN 1.0 ELSE 0.0 END) * 100.0, 2) AS assumed_pct, \
             ROUND(AVG(CASE WHEN rented = 1 THEN 1.0 ELSE 0.0 END) * 100.0, 2) AS api_pct \
             FROM offers_raw"
        );
        if let Some(condition) = filter.sql_condition() {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
        sql.push_str(" GROUP BY 1, 2");

        let query = filter.bind(sqlx::query(&sql));
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| RollupRow {
                gpu_name: row.get("gpu_name"),
                gpus: row.get("gpus"),
                samples: row.get("samples"),
                assumed_rented_time_pct: row.get("assumed_pct"),
                api_rented_time_pct: row.get("api_pct"),
            })
            .collect())
    }

    /// Earliest and latest stored timestamps, if any rows exist.
    pub async fn ts_bounds(&self) -> StoreResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT MIN(ts) AS min_ts, MAX(ts) AS max_ts FROM offers_raw")
            .fetch_one(&self.pool)
            .await?;
        let min_ts: Option<String> = row.get("min_ts");
        let max_ts: Option<String> = row.get("max_ts");
        match (min_ts, max_ts) {
            (Some(min_raw), Some(max_raw)) => {
                let min = parse_ts(&min_raw).ok_or(StoreError::InvalidTimestamp(min_raw))?;
                let max = parse_ts(&max_raw).ok_or(StoreError::InvalidTimestamp(max_raw))?;
                Ok(Some((min, max)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AvailabilityState;
    use chrono::TimeZone;

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

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, hour, 0, 0).unwrap()
    }

    fn snapshot(offer_id: i64, at: DateTime<Utc>, rentable: Option<i64>) -> OfferSnapshot {
        OfferSnapshot {
            ts: at,
            offer_id,
            machine_id: offer_id * 10,
            gpu_name: Some("RTX 4090".to_string()),
            num_gpus: 2,
            gpu_frac: Some(1.0),
            gpu_total_ram_gb: Some(24.0),
            dph_total_usd: Some(0.5),
            reliability2: Some(0.98),
            geolocation: Some("Oslo, NO".to_string()),
            offer_type: Some("on-demand".to_string()),
            rentable,
            rented: Some(0),
            verified: 1,
            deverified: 0,
            availability_state: AvailabilityState::Available,
        }
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let store = memory_store().await;
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_schema_adds_missing_columns() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        // Legacy layout without the verification and state columns.
        sqlx::query("CREATE TABLE offers_raw (ts TEXT NOT NULL, offer_id INTEGER NOT NULL, machine_id INTEGER, gpu_name TEXT, num_gpus INTEGER, gpu_frac REAL, gpu_total_ram_gb REAL, dph_total_usd REAL, reliability2 REAL, geolocation TEXT, type TEXT, rentable INTEGER, rented INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let store = SnapshotStore::new(pool);
        store.ensure_schema().await.unwrap();

        // Inserting through the full column list only works if the columns
        // were added.
        let inserted = store
            .insert_snapshots(&[snapshot(1, ts(0), Some(1))])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn select_range_orders_by_offer_then_ts() {
        let store = memory_store().await;
        store
            .insert_snapshots(&[
                snapshot(2, ts(0), Some(1)),
                snapshot(1, ts(1), Some(0)),
                snapshot(1, ts(0), Some(1)),
            ])
            .await
            .unwrap();

        let rows = store.select_range(ts(0), ts(2)).await.unwrap();
        let keys: Vec<(i64, DateTime<Utc>)> = rows.iter().map(|r| (r.offer_id, r.ts)).collect();
        assert_eq!(keys, vec![(1, ts(0)), (1, ts(1)), (2, ts(0))]);
    }

    #[tokio::test]
    async fn latest_rows_come_from_the_newest_cycle_only() {
        let store = memory_store().await;
        store
            .insert_snapshots(&[snapshot(1, ts(0), Some(1)), snapshot(2, ts(0), Some(1))])
            .await
            .unwrap();
        store
            .insert_snapshots(&[snapshot(1, ts(1), Some(0))])
            .await
            .unwrap();

        let rows = store.select_latest_rows(&GpuFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rentable, Some(0));
    }

    #[tokio::test]
    async fn latest_rows_honor_gpu_name_filter() {
        let store = memory_store().await;
        let mut other = snapshot(2, ts(0), Some(1));
        other.gpu_name = Some("H100".to_string());
        store
            .insert_snapshots(&[snapshot(1, ts(0), Some(1)), other])
            .await
            .unwrap();

        let filter = GpuFilter::from_tokens(&["h100".to_string()], &[], None);
        let rows = store.select_latest_rows(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gpu_name.as_deref(), Some("H100"));
    }

    #[tokio::test]
    async fn history_rollup_averages_over_all_cycles() {
        let store = memory_store().await;
        store
            .insert_snapshots(&[snapshot(1, ts(0), Some(1)), snapshot(1, ts(1), Some(0))])
            .await
            .unwrap();

        let rollup = store
            .select_history_rollup(&GpuFilter::default())
            .await
            .unwrap();
        assert_eq!(rollup.len(), 1);
        assert_eq!(rollup[0].gpus, "2x");
        assert_eq!(rollup[0].samples, 2);
        assert_eq!(rollup[0].assumed_rented_time_pct, 50.0);
        assert_eq!(rollup[0].api_rented_time_pct, 0.0);
    }

    #[tokio::test]
    async fn ts_bounds_on_empty_store_is_none() {
        let store = memory_store().await;
        assert!(store.ts_bounds().await.unwrap().is_none());

        store
            .insert_snapshots(&[snapshot(1, ts(3), Some(1))])
            .await
            .unwrap();
        let (min, max) = store.ts_bounds().await.unwrap().unwrap();
        assert_eq!(min, ts(3));
        assert_eq!(max, ts(3));
    }
}
