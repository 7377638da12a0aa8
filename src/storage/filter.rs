//! Row pre-filters for the reporting queries
//!
//! Applied in SQL before aggregation: case-insensitive substring match on
//! GPU name (OR across the provided tokens), exact GPU-count membership, and
//! an optional verified/unverified partition.

use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;

/// Pre-aggregation row filter.
#[derive(Debug, Clone, Default)]
pub struct GpuFilter {
    /// GPU-name substrings; a row matches when any token is contained,
    /// case-insensitively.
    pub name_contains: Vec<String>,
    /// Exact `num_gpus` membership set.
    pub gpu_counts: Vec<i64>,
    /// When set, keep only rows with `COALESCE(verified, 0)` equal to this.
    pub verified: Option<bool>,
}

impl GpuFilter {
    /// Parse repeatable, comma-separated CLI tokens into a filter.
    pub fn from_tokens(names: &[String], counts: &[String], verified: Option<bool>) -> Self {
        let name_contains = split_tokens(names);
        let gpu_counts = split_tokens(counts)
            .into_iter()
            .filter_map(|token| token.parse::<i64>().ok())
            .collect();
        Self {
            name_contains,
            gpu_counts,
            verified,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name_contains.is_empty() && self.gpu_counts.is_empty() && self.verified.is_none()
    }

    /// SQL condition (without the `WHERE`/`AND` keyword), or `None` when the
    /// filter is empty. Placeholders line up with [`GpuFilter::bind`].
    pub fn sql_condition(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if !self.name_contains.is_empty() {
            let likes = vec!["LOWER(gpu_name) LIKE '%' || ? || '%'"; self.name_contains.len()];
            clauses.push(format!("({})", likes.join(" OR ")));
        }
        if !self.gpu_counts.is_empty() {
            let placeholders = vec!["?"; self.gpu_counts.len()];
            clauses.push(format!("num_gpus IN ({})", placeholders.join(",")));
        }
        if self.verified.is_some() {
            clauses.push("COALESCE(verified, 0) = ?".to_string());
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }

    /// Bind this filter's parameters in the order emitted by
    /// [`GpuFilter::sql_condition`].
    pub fn bind<'q>(
        &self,
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for name in &self.name_contains {
            query = query.bind(name.to_lowercase());
        }
        for count in &self.gpu_counts {
            query = query.bind(*count);
        }
        if let Some(verified) = self.verified {
            query = query.bind(i64::from(verified));
        }
        query
    }
}

fn split_tokens(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_split_on_commas_and_trim() {
        let filter = GpuFilter::from_tokens(
            &["4090, 3090".to_string(), "h100".to_string()],
            &["1,2".to_string(), "bogus".to_string(), "8".to_string()],
            None,
        );
        assert_eq!(filter.name_contains, vec!["4090", "3090", "h100"]);
        assert_eq!(filter.gpu_counts, vec![1, 2, 8]);
    }

    #[test]
    fn empty_filter_has_no_condition() {
        assert_eq!(GpuFilter::default().sql_condition(), None);
    }

    #[test]
    fn condition_combines_all_clauses() {
        let filter = GpuFilter {
            name_contains: vec!["4090".into(), "a100".into()],
            gpu_counts: vec![1, 2],
            verified: Some(true),
        };
        let sql = filter.sql_condition().unwrap();
        assert_eq!(
            sql,
            "(LOWER(gpu_name) LIKE '%' || ? || '%' OR LOWER(gpu_name) LIKE '%' || ? || '%') \
             AND num_gpus IN (?,?) AND COALESCE(verified, 0) = ?"
        );
    }
}
