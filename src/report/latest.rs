//! Cross-sectional utilization snapshot
//!
//! Aggregates the rows of the single most recent polling cycle by
//! `(gpu_name, gpu-count bucket)`, joins the all-history occupancy rollup
//! onto each group, and dense-ranks the groups by assumed utilization.
//!
//! Two query variants produce identical rows: when the store declares
//! window-function support the whole report is one SQL statement; otherwise
//! plain row selects are aggregated and ranked here. The variant is chosen
//! from the declared capability, never by catching a failed statement.

use sqlx::Row;
use std::collections::{BTreeMap, HashMap};

use crate::report::{round_to, ReportResult};
use crate::storage::{GpuFilter, RollupRow, SnapshotRow, SnapshotStore, StoreError};

/// One ranked aggregate row of the latest-snapshot report.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotGroup {
    /// Dense rank: ties share a rank, the next distinct group takes the next
    /// integer.
    pub rank: i64,
    pub gpu_name: Option<String>,
    pub gpus: String,
    pub total: i64,
    pub available: i64,
    pub assumed_utilized: i64,
    pub api_rented: i64,
    /// Unrentable but not API-flagged as rented.
    pub unflagged: i64,
    pub rentable_unknown: i64,
    pub assumed_utilization_pct: f64,
    pub api_rented_pct: f64,
    pub avg_price_available: Option<f64>,
    pub avg_price_utilized: Option<f64>,
    /// Effective price per GPU of the utilized subset; `None` when the
    /// utilized price or the GPU-count denominator is unavailable.
    pub price_per_gpu: Option<f64>,
    pub verified: i64,
    pub deverified: i64,
    pub time_pct_assumed: f64,
    pub time_pct_api: f64,
    pub occupancy_samples: i64,
}

/// GPU-count bucket label: `"{n}x"` for 1-10, `"10x+"` above, else
/// `"unknown"`.
pub fn gpu_count_bucket(num_gpus: i64) -> String {
    match num_gpus {
        1..=10 => format!("{num_gpus}x"),
        n if n > 10 => "10x+".to_string(),
        _ => "unknown".to_string(),
    }
}

const BUCKET_EXPR: &str = "CASE \
     WHEN num_gpus BETWEEN 1 AND 10 THEN CAST(num_gpus AS TEXT) || 'x' \
     WHEN num_gpus > 10 THEN '10x+' \
     ELSE 'unknown' END";

/// Produce the ranked latest-snapshot report, picking the query variant from
/// the store's declared capabilities.
pub async fn latest_snapshot(
    store: &SnapshotStore,
    filter: &GpuFilter,
) -> ReportResult<Vec<SnapshotGroup>> {
    if store.capabilities().window_functions {
        latest_snapshot_windowed(store, filter).await
    } else {
        let rows = store.select_latest_rows(filter).await?;
        let rollup = store.select_history_rollup(filter).await?;
        Ok(aggregate_latest(&rows, &rollup))
    }
}

/// Single-statement variant using `DENSE_RANK`.
async fn latest_snapshot_windowed(
    store: &SnapshotStore,
    filter: &GpuFilter,
) -> ReportResult<Vec<SnapshotGroup>> {
    let where_clause = match filter.sql_condition() {
        Some(condition) => format!("WHERE {condition}"),
        None => String::new(),
    };
    let sql = format!(
        r#"
WITH latest AS (
  SELECT * FROM offers_raw WHERE ts = (SELECT MAX(ts) FROM offers_raw)
),
agg AS (
  SELECT
    gpu_name,
    {BUCKET_EXPR} AS gpus,
    COUNT(*) AS total_offers,
    SUM(CASE WHEN rentable = 1 THEN 1 ELSE 0 END) AS available_offers,
    SUM(CASE WHEN rentable = 0 THEN 1 ELSE 0 END) AS assumed_utilized_offers,
    SUM(CASE WHEN rented = 1 THEN 1 ELSE 0 END) AS api_rented_offers,
    SUM(CASE WHEN rentable = 0 AND COALESCE(rented, 0) = 0 THEN 1 ELSE 0 END) AS unflagged_offers,
    SUM(CASE WHEN rentable IS NULL THEN 1 ELSE 0 END) AS rentable_unknown_offers,
    ROUND(100.0 * CAST(SUM(CASE WHEN rentable = 0 THEN 1 ELSE 0 END) AS FLOAT) /
      NULLIF(COUNT(*), 0), 1) AS assumed_utilization_pct,
    ROUND(100.0 * CAST(SUM(CASE WHEN rented = 1 THEN 1 ELSE 0 END) AS FLOAT) /
      NULLIF(COUNT(*), 0), 1) AS api_rented_pct,
    ROUND(AVG(CASE WHEN rentable = 1 THEN dph_total_usd END), 3) AS avg_price_available,
    ROUND(AVG(CASE WHEN rentable = 0 THEN dph_total_usd END), 3) AS avg_price_utilized,
    SUM(CASE WHEN COALESCE(verified, 0) = 1 THEN 1 ELSE 0 END) AS verified_offers,
    SUM(CASE WHEN COALESCE(deverified, 0) = 1 THEN 1 ELSE 0 END) AS deverified_offers,
    AVG(num_gpus) AS avg_gpu_count
  FROM latest
  {where_clause}
  GROUP BY 1, 2
),
occupancy AS (
  SELECT
    gpu_name,
    {BUCKET_EXPR} AS gpus,
    COUNT(*) AS occupancy_samples,
    ROUND(AVG(CASE WHEN rentable = 0 THEN 1.0 ELSE 0.0 END) * 100.0, 2) AS assumed_time_pct,
    ROUND(AVG(CASE WHEN rented = 1 THEN 1.0 ELSE 0.0 END) * 100.0, 2) AS api_time_pct
  FROM offers_raw
  {where_clause}
  GROUP BY 1, 2
)
SELECT
  DENSE_RANK() OVER (
    ORDER BY
      agg.assumed_utilized_offers DESC,
      agg.assumed_utilization_pct DESC,
      agg.available_offers DESC
  ) AS util_rank,
  agg.gpu_name,
  agg.gpus,
  agg.total_offers,
  agg.available_offers,
  agg.assumed_utilized_offers,
  agg.api_rented_offers,
  agg.unflagged_offers,
  agg.rentable_unknown_offers,
  agg.assumed_utilization_pct,
  agg.api_rented_pct,
  agg.avg_price_available,
  agg.avg_price_utilized,
  ROUND(
    CASE
      WHEN agg.avg_gpu_count IS NULL OR agg.avg_gpu_count = 0 OR agg.avg_price_utilized IS NULL
        THEN NULL
      ELSE agg.avg_price_utilized * (agg.assumed_utilization_pct / 100.0) / agg.avg_gpu_count
    END, 4) AS price_per_gpu,
  agg.verified_offers,
  agg.deverified_offers,
  COALESCE(occupancy.assumed_time_pct, 0.0) AS time_pct_assumed,
  COALESCE(occupancy.api_time_pct, 0.0) AS time_pct_api,
  COALESCE(occupancy.occupancy_samples, 0) AS occupancy_samples
FROM agg
LEFT JOIN occupancy
  ON occupancy.gpu_name IS agg.gpu_name
  AND occupancy.gpus = agg.gpus
ORDER BY util_rank, agg.gpu_name, agg.gpus
"#
    );

    // The filter condition appears in both CTEs, so its parameters bind twice.
    let query = filter.bind(filter.bind(sqlx::query(&sql)));
    let rows = query
        .fetch_all(store.pool())
        .await
        .map_err(StoreError::Database)?;

    Ok(rows
        .iter()
        .map(|row| SnapshotGroup {
            rank: row.get("util_rank"),
            gpu_name: row.get("gpu_name"),
            gpus: row.get("gpus"),
            total: row.get("total_offers"),
            available: row.get("available_offers"),
            assumed_utilized: row.get("assumed_utilized_offers"),
            api_rented: row.get("api_rented_offers"),
            unflagged: row.get("unflagged_offers"),
            rentable_unknown: row.get("rentable_unknown_offers"),
            assumed_utilization_pct: row.get("assumed_utilization_pct"),
            api_rented_pct: row.get("api_rented_pct"),
            avg_price_available: row.get("avg_price_available"),
            avg_price_utilized: row.get("avg_price_utilized"),
            price_per_gpu: row.get("price_per_gpu"),
            verified: row.get("verified_offers"),
            deverified: row.get("deverified_offers"),
            time_pct_assumed: row.get("time_pct_assumed"),
            time_pct_api: row.get("time_pct_api"),
            occupancy_samples: row.get("occupancy_samples"),
        })
        .collect())
}

/// Portable variant: aggregate latest-cycle rows and join the rollup here.
pub fn aggregate_latest(rows: &[SnapshotRow], rollup: &[RollupRow]) -> Vec<SnapshotGroup> {
    let rollup_index: HashMap<(Option<&str>, &str), &RollupRow> = rollup
        .iter()
        .map(|entry| ((entry.gpu_name.as_deref(), entry.gpus.as_str()), entry))
        .collect();

    let mut grouped: BTreeMap<(Option<String>, String), Vec<&SnapshotRow>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry((row.gpu_name.clone(), gpu_count_bucket(row.num_gpus)))
            .or_default()
            .push(row);
    }

    let mut groups: Vec<SnapshotGroup> = grouped
        .into_iter()
        .map(|((gpu_name, gpus), members)| {
            let total = members.len() as i64;
            let available = count(&members, |r| r.rentable == Some(1));
            let assumed_utilized = count(&members, |r| r.rentable == Some(0));
            let api_rented = count(&members, |r| r.rented == Some(1));
            let unflagged = count(&members, |r| {
                r.rentable == Some(0) && r.rented.unwrap_or(0) == 0
            });
            let rentable_unknown = count(&members, |r| r.rentable.is_none());
            let verified = count(&members, |r| r.verified == 1);
            let deverified = count(&members, |r| r.deverified == 1);

            let assumed_utilization_pct =
                round_to(100.0 * assumed_utilized as f64 / total as f64, 1);
            let api_rented_pct = round_to(100.0 * api_rented as f64 / total as f64, 1);
            let avg_price_available =
                avg_price(&members, |r| r.rentable == Some(1)).map(|p| round_to(p, 3));
            let avg_price_utilized =
                avg_price(&members, |r| r.rentable == Some(0)).map(|p| round_to(p, 3));
            let avg_gpu_count =
                members.iter().map(|r| r.num_gpus as f64).sum::<f64>() / members.len() as f64;

            let price_per_gpu = match (avg_price_utilized, avg_gpu_count) {
                (Some(price), denom) if denom != 0.0 => {
                    Some(round_to(price * (assumed_utilization_pct / 100.0) / denom, 4))
                }
                _ => None,
            };

            let (time_pct_assumed, time_pct_api, occupancy_samples) = rollup_index
                .get(&(gpu_name.as_deref(), gpus.as_str()))
                .map_or((0.0, 0.0, 0), |h| {
                    (h.assumed_rented_time_pct, h.api_rented_time_pct, h.samples)
                });

            SnapshotGroup {
                rank: 0,
                gpu_name,
                gpus,
                total,
                available,
                assumed_utilized,
                api_rented,
                unflagged,
                rentable_unknown,
                assumed_utilization_pct,
                api_rented_pct,
                avg_price_available,
                avg_price_utilized,
                price_per_gpu,
                verified,
                deverified,
                time_pct_assumed,
                time_pct_api,
                occupancy_samples,
            }
        })
        .collect();

    assign_dense_ranks(&mut groups);
    groups
}

fn count(members: &[&SnapshotRow], pred: impl Fn(&SnapshotRow) -> bool) -> i64 {
    members.iter().filter(|r| pred(r)).count() as i64
}

fn avg_price(members: &[&SnapshotRow], pred: impl Fn(&SnapshotRow) -> bool) -> Option<f64> {
    let prices: Vec<f64> = members
        .iter()
        .filter(|r| pred(r))
        .filter_map(|r| r.dph_total_usd)
        .collect();
    if prices.is_empty() {
        None
    } else {
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    }
}

/// Sort by the utilization ordering and assign dense ranks: tied groups share
/// a rank, the next distinct group takes the next integer (no gaps).
fn assign_dense_ranks(groups: &mut [SnapshotGroup]) {
    let rank_key = |g: &SnapshotGroup| (g.assumed_utilized, g.assumed_utilization_pct, g.available);
    groups.sort_by(|a, b| {
        let (au_a, pct_a, av_a) = rank_key(a);
        let (au_b, pct_b, av_b) = rank_key(b);
        au_b.cmp(&au_a)
            .then(pct_b.total_cmp(&pct_a))
            .then(av_b.cmp(&av_a))
            .then(a.gpu_name.cmp(&b.gpu_name))
            .then(a.gpus.cmp(&b.gpus))
    });

    let mut rank = 0i64;
    let mut previous: Option<(i64, f64, f64)> = None;
    for group in groups.iter_mut() {
        let key = (
            group.assumed_utilized,
            group.assumed_utilization_pct,
            group.available as f64,
        );
        if previous != Some(key) {
            rank += 1;
            previous = Some(key);
        }
        group.rank = rank;
    }
}

/// Post-sort the report rows by a named column. A `+` prefix sorts
/// ascending, `-` (or no prefix) descending; unknown columns leave the
/// ranked order untouched.
pub fn sort_groups(groups: &mut [SnapshotGroup], spec: &str) {
    let spec = spec.trim();
    if spec.is_empty() {
        return;
    }
    let (descending, column) = if let Some(rest) = spec.strip_prefix('+') {
        (false, rest)
    } else if let Some(rest) = spec.strip_prefix('-') {
        (true, rest)
    } else {
        (true, spec)
    };

    if column == "gpu_name" || column == "gpus" {
        let key = |g: &SnapshotGroup| match column {
            "gpu_name" => g.gpu_name.clone().unwrap_or_default(),
            _ => g.gpus.clone(),
        };
        groups.sort_by(|a, b| {
            let ord = key(a).cmp(&key(b));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        return;
    }

    let Some(key) = numeric_column(column) else {
        return;
    };
    groups.sort_by(|a, b| {
        let ord = numeric_sort_value(key(a)).total_cmp(&numeric_sort_value(key(b)));
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

type ColumnKey = fn(&SnapshotGroup) -> Option<f64>;

fn numeric_column(name: &str) -> Option<ColumnKey> {
    let key: ColumnKey = match name {
        "util_rank" => |g| Some(g.rank as f64),
        "offers_total" => |g| Some(g.total as f64),
        "offers_avail" => |g| Some(g.available as f64),
        "offers_util_assumed" => |g| Some(g.assumed_utilized as f64),
        "offers_util_api" => |g| Some(g.api_rented as f64),
        "offers_unflagged" => |g| Some(g.unflagged as f64),
        "offers_rentable_unknown" => |g| Some(g.rentable_unknown as f64),
        "util_pct_assumed" => |g| Some(g.assumed_utilization_pct),
        "util_pct_api" => |g| Some(g.api_rented_pct),
        "price_avail_avg" => |g| g.avg_price_available,
        "price_util_avg" => |g| g.avg_price_utilized,
        "price_per_gpu" => |g| g.price_per_gpu,
        "verified" => |g| Some(g.verified as f64),
        "deverified" => |g| Some(g.deverified as f64),
        "time_pct_assumed" => |g| Some(g.time_pct_assumed),
        "time_pct_api" => |g| Some(g.time_pct_api),
        "occupancy_samples" => |g| Some(g.occupancy_samples as f64),
        _ => return None,
    };
    Some(key)
}

fn numeric_sort_value(value: Option<f64>) -> f64 {
    value.unwrap_or(f64::NEG_INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AvailabilityState, OfferSnapshot};
    use chrono::{DateTime, TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;

    fn snapshot_row(
        gpu_name: &str,
        num_gpus: i64,
        rentable: Option<i64>,
        rented: Option<i64>,
        price: Option<f64>,
    ) -> SnapshotRow {
        SnapshotRow {
            gpu_name: Some(gpu_name.to_string()),
            num_gpus,
            rentable,
            rented,
            dph_total_usd: price,
            verified: 0,
            deverified: 0,
        }
    }

    #[test]
    fn bucket_labels_cover_all_ranges() {
        assert_eq!(gpu_count_bucket(1), "1x");
        assert_eq!(gpu_count_bucket(10), "10x");
        assert_eq!(gpu_count_bucket(11), "10x+");
        assert_eq!(gpu_count_bucket(0), "unknown");
        assert_eq!(gpu_count_bucket(-2), "unknown");
    }

    #[test]
    fn groups_aggregate_counts_and_prices() {
        let rows = vec![
            snapshot_row("RTX 4090", 1, Some(1), Some(0), Some(0.4)),
            snapshot_row("RTX 4090", 1, Some(0), Some(1), Some(0.6)),
            snapshot_row("RTX 4090", 1, Some(0), Some(0), Some(0.8)),
            snapshot_row("RTX 4090", 1, None, None, None),
        ];
        let groups = aggregate_latest(&rows, &[]);
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.total, 4);
        assert_eq!(g.available, 1);
        assert_eq!(g.assumed_utilized, 2);
        assert_eq!(g.api_rented, 1);
        assert_eq!(g.unflagged, 1);
        assert_eq!(g.rentable_unknown, 1);
        assert_eq!(g.assumed_utilization_pct, 50.0);
        assert_eq!(g.api_rented_pct, 25.0);
        assert_eq!(g.avg_price_available, Some(0.4));
        assert_eq!(g.avg_price_utilized, Some(0.7));
        // 0.7 * 0.5 / 1 GPU
        assert_eq!(g.price_per_gpu, Some(0.35));
    }

    #[test]
    fn price_per_gpu_is_none_without_utilized_price() {
        let rows = vec![snapshot_row("H100", 8, Some(1), Some(0), Some(20.0))];
        let groups = aggregate_latest(&rows, &[]);
        assert_eq!(groups[0].price_per_gpu, None);
    }

    #[test]
    fn dense_rank_has_no_gaps() {
        let rows = vec![
            // Two groups tied on (assumed=1, pct=100, available=0).
            snapshot_row("A", 1, Some(0), Some(0), None),
            snapshot_row("B", 1, Some(0), Some(0), None),
            // A weaker third group.
            snapshot_row("C", 1, Some(1), Some(0), None),
        ];
        let groups = aggregate_latest(&rows, &[]);
        let ranks: Vec<i64> = groups.iter().map(|g| g.rank).collect();
        assert_eq!(ranks, vec![1, 1, 2]);
    }

    #[test]
    fn history_rollup_joins_on_group_key() {
        let rows = vec![snapshot_row("RTX 4090", 2, Some(0), Some(1), Some(0.5))];
        let rollup = vec![RollupRow {
            gpu_name: Some("RTX 4090".to_string()),
            gpus: "2x".to_string(),
            samples: 40,
            assumed_rented_time_pct: 62.5,
            api_rented_time_pct: 55.0,
        }];
        let groups = aggregate_latest(&rows, &rollup);
        let g = &groups[0];
        assert_eq!(g.occupancy_samples, 40);
        assert_eq!(g.time_pct_assumed, 62.5);
        assert_eq!(g.time_pct_api, 55.0);
    }

    #[test]
    fn missing_rollup_defaults_to_zero() {
        let rows = vec![snapshot_row("H100", 8, Some(0), Some(1), Some(20.0))];
        let groups = aggregate_latest(&rows, &[]);
        assert_eq!(groups[0].time_pct_assumed, 0.0);
        assert_eq!(groups[0].occupancy_samples, 0);
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

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, hour, 0, 0).unwrap()
    }

    #[allow(clippy::too_many_arguments)]
    fn stored(
        offer_id: i64,
        at: DateTime<Utc>,
        gpu_name: &str,
        num_gpus: i64,
        rentable: i64,
        rented: i64,
        price: f64,
        verified: i64,
    ) -> OfferSnapshot {
        OfferSnapshot {
            ts: at,
            offer_id,
            machine_id: offer_id * 10,
            gpu_name: Some(gpu_name.to_string()),
            num_gpus,
            gpu_frac: Some(1.0),
            gpu_total_ram_gb: Some(24.0),
            dph_total_usd: Some(price),
            reliability2: Some(0.95),
            geolocation: Some("Oslo, NO".to_string()),
            offer_type: Some("on-demand".to_string()),
            rentable: Some(rentable),
            rented: Some(rented),
            verified,
            deverified: 0,
            availability_state: AvailabilityState::Unknown,
        }
    }

    async fn portable(store: &SnapshotStore, filter: &GpuFilter) -> Vec<SnapshotGroup> {
        let rows = store.select_latest_rows(filter).await.unwrap();
        let rollup = store.select_history_rollup(filter).await.unwrap();
        aggregate_latest(&rows, &rollup)
    }

    #[tokio::test]
    async fn windowed_and_portable_variants_agree() {
        let store = memory_store().await;
        store
            .insert_snapshots(&[
                stored(1, ts(0), "RTX 4090", 1, 1, 0, 0.4, 1),
                stored(2, ts(0), "RTX 4090", 1, 0, 1, 0.6, 1),
                stored(3, ts(0), "H100", 8, 0, 0, 20.0, 0),
                stored(1, ts(1), "RTX 4090", 1, 1, 0, 0.4, 1),
                stored(2, ts(1), "RTX 4090", 1, 0, 1, 0.6, 1),
                stored(3, ts(1), "H100", 8, 0, 1, 16.0, 0),
            ])
            .await
            .unwrap();

        let unfiltered = GpuFilter::default();
        let windowed = latest_snapshot_windowed(&store, &unfiltered)
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);
        // Tied on utilized count, H100 wins on utilization pct.
        assert_eq!(windowed[0].gpu_name.as_deref(), Some("H100"));
        assert_eq!(windowed[0].rank, 1);
        assert_eq!(windowed[0].price_per_gpu, Some(2.0));
        assert_eq!(windowed[1].rank, 2);
        assert_eq!(windowed, portable(&store, &unfiltered).await);

        // A non-empty filter binds its parameters in both CTEs.
        let filtered = GpuFilter::from_tokens(&["4090".to_string()], &[], Some(true));
        let windowed = latest_snapshot_windowed(&store, &filtered).await.unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].gpu_name.as_deref(), Some("RTX 4090"));
        assert_eq!(windowed[0].occupancy_samples, 4);
        assert_eq!(windowed[0].time_pct_assumed, 50.0);
        assert_eq!(windowed, portable(&store, &filtered).await);
    }

    #[test]
    fn sort_spec_prefix_controls_direction() {
        let rows = vec![
            snapshot_row("A", 1, Some(0), Some(1), Some(1.0)),
            snapshot_row("B", 1, Some(1), Some(0), Some(2.0)),
        ];
        let mut groups = aggregate_latest(&rows, &[]);

        sort_groups(&mut groups, "+price_util_avg");
        // B has no utilized price, so it sorts first ascending (None is lowest).
        assert_eq!(groups[0].gpu_name.as_deref(), Some("B"));

        sort_groups(&mut groups, "-util_pct_api");
        assert_eq!(groups[0].gpu_name.as_deref(), Some("A"));

        let before: Vec<Option<String>> = groups.iter().map(|g| g.gpu_name.clone()).collect();
        sort_groups(&mut groups, "no_such_column");
        let after: Vec<Option<String>> = groups.iter().map(|g| g.gpu_name.clone()).collect();
        assert_eq!(before, after);
    }
}
