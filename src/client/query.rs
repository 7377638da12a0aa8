//! Search query construction

use serde_json::{json, Map, Value};

/// Result-size cap sent with every search query.
const SEARCH_LIMIT: u64 = 10_000;

/// Build the structured filter object for one "search offers" call.
///
/// Starts from the fixed base filter set (exclude externally-hosted offers,
/// explicit `rented` flag, optional `rentable` flag, optional verified-only
/// toggle), shallow-merges caller-supplied extras on top (extras win on key
/// collision), then fills in the `type` filter only if the caller left it
/// unset.
pub fn build_search_query(
    rented: bool,
    rentable: Option<bool>,
    include_unverified: bool,
    extra_filters: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let mut query = Map::new();
    query.insert("rented".to_string(), json!({ "eq": rented }));
    query.insert("external".to_string(), json!({ "eq": false }));
    query.insert("limit".to_string(), json!(SEARCH_LIMIT));
    if let Some(rentable) = rentable {
        query.insert("rentable".to_string(), json!({ "eq": rentable }));
    }
    if !include_unverified {
        query.insert("verified".to_string(), json!({ "eq": true }));
    }
    if let Some(extra) = extra_filters {
        for (key, value) in extra {
            query.insert(key.clone(), value.clone());
        }
    }
    query
        .entry("type".to_string())
        .or_insert_with(|| json!("on-demand"));
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_query_has_fixed_filters() {
        let query = build_search_query(false, Some(true), true, None);
        assert_eq!(query["rented"], json!({ "eq": false }));
        assert_eq!(query["rentable"], json!({ "eq": true }));
        assert_eq!(query["external"], json!({ "eq": false }));
        assert_eq!(query["limit"], json!(10_000));
        assert_eq!(query["type"], json!("on-demand"));
        assert!(!query.contains_key("verified"));
    }

    #[test]
    fn rentable_filter_is_omitted_when_unset() {
        let query = build_search_query(true, None, true, None);
        assert!(!query.contains_key("rentable"));
    }

    #[test]
    fn verified_filter_appears_when_unverified_excluded() {
        let query = build_search_query(false, Some(true), false, None);
        assert_eq!(query["verified"], json!({ "eq": true }));
    }

    #[test]
    fn extra_filters_override_base_keys() {
        let extra = json!({ "limit": 50, "gpu_name": { "eq": "RTX 4090" } });
        let query = build_search_query(false, Some(true), true, extra.as_object());
        assert_eq!(query["limit"], json!(50));
        assert_eq!(query["gpu_name"], json!({ "eq": "RTX 4090" }));
    }

    #[test]
    fn caller_supplied_type_is_kept() {
        let extra = json!({ "type": "interruptible" });
        let query = build_search_query(false, Some(true), true, extra.as_object());
        assert_eq!(query["type"], json!("interruptible"));
    }
}
