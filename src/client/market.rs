//! Marketplace HTTP client
//!
//! One endpoint: "search offers". Each call is classified into a retryable
//! or fatal [`ClientError`] and driven through the retry policy.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::client::error::{ClientError, ClientResult};
use crate::client::query::build_search_query;
use crate::client::retry::{fetch_with_retry, RetryPolicy};
use crate::config::UpstreamSettings;
use crate::schema::RawOffer;

/// Conventional top-level keys the offer array may hide under.
const CONTAINER_KEYS: &[&str] = &["offers", "matches", "data", "result"];

/// Source of raw offer records, one call per query partition.
///
/// The collector polls through this trait so tests can substitute a
/// scripted source for the live marketplace.
#[async_trait]
pub trait OfferSource: Send + Sync {
    async fn search_offers(
        &self,
        rented: bool,
        rentable: Option<bool>,
    ) -> ClientResult<Vec<RawOffer>>;
}

/// HTTP client for the marketplace's "search offers" API.
pub struct MarketClient {
    http: Client,
    endpoint: String,
    api_key: String,
    include_unverified: bool,
    extra_filters: Option<Map<String, Value>>,
    policy: RetryPolicy,
}

impl MarketClient {
    pub fn from_settings(settings: &UpstreamSettings) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| {
                ClientError::Configuration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            endpoint: format!("{}/bundles/", settings.base_url.trim_end_matches('/')),
            api_key: settings.api_key.clone(),
            include_unverified: settings.include_unverified,
            extra_filters: settings.extra_filters.clone(),
            policy: RetryPolicy::default(),
        })
    }

    /// One attempt: send the query and classify the outcome.
    async fn search_once(&self, query: &Map<String, Value>) -> ClientResult<Vec<RawOffer>> {
        debug!(endpoint = %self.endpoint, "POST search offers");
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let retry_after = parse_retry_after(&response);
            return Err(ClientError::Upstream {
                status: status.as_u16(),
                retry_after,
            });
        }

        if status == StatusCode::OK {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();
            let text = response.text().await?;
            if !content_type.contains("json") {
                return Err(ClientError::Structural(format!(
                    "unexpected content-type {:?}; body starts with {:?}",
                    content_type,
                    snippet(&text, 200)
                )));
            }
            let body: Value = serde_json::from_str(&text).map_err(|e| {
                ClientError::Structural(format!(
                    "invalid JSON: {e}; body starts with {:?}",
                    snippet(&text, 200)
                ))
            })?;
            return extract_offers(body);
        }

        let detail = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            detail: snippet(&detail, 500).to_string(),
        })
    }
}

#[async_trait]
impl OfferSource for MarketClient {
    async fn search_offers(
        &self,
        rented: bool,
        rentable: Option<bool>,
    ) -> ClientResult<Vec<RawOffer>> {
        let query = build_search_query(
            rented,
            rentable,
            self.include_unverified,
            self.extra_filters.as_ref(),
        );
        fetch_with_retry(&self.policy, || self.search_once(&query)).await
    }
}

/// Locate the offer array inside a response body: the conventional container
/// keys first, then the first array-valued top-level field.
fn extract_offers(body: Value) -> ClientResult<Vec<RawOffer>> {
    let Value::Object(mut map) = body else {
        return Err(ClientError::Structural(
            "response body is not a JSON object".to_string(),
        ));
    };

    let array = CONTAINER_KEYS
        .iter()
        .find(|key| matches!(map.get(**key), Some(Value::Array(_))))
        .map(|key| map.remove(*key))
        .unwrap_or_else(|| {
            let fallback = map
                .iter()
                .find(|(_, value)| value.is_array())
                .map(|(key, _)| key.clone());
            fallback.and_then(|key| map.remove(&key))
        });

    match array {
        Some(Value::Array(items)) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(obj) => Some(obj),
                _ => None,
            })
            .collect()),
        _ => Err(ClientError::Structural(
            "no list of offers in response".to_string(),
        )),
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn snippet(text: &str, limit: usize) -> &str {
    let mut end = limit.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offers_found_under_conventional_keys() {
        for key in ["offers", "matches", "data", "result"] {
            let body = json!({ key: [{ "id": 1 }, { "id": 2 }] });
            let offers = extract_offers(body).unwrap();
            assert_eq!(offers.len(), 2, "key {key}");
        }
    }

    #[test]
    fn falls_back_to_first_array_valued_field() {
        let body = json!({ "meta": { "page": 1 }, "things": [{ "id": 9 }] });
        let offers = extract_offers(body).unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0]["id"], json!(9));
    }

    #[test]
    fn missing_array_is_a_structural_error() {
        let body = json!({ "count": 3 });
        assert!(matches!(
            extract_offers(body),
            Err(ClientError::Structural(_))
        ));
    }

    #[test]
    fn non_object_items_are_dropped() {
        let body = json!({ "offers": [{ "id": 1 }, 42, "junk"] });
        let offers = extract_offers(body).unwrap();
        assert_eq!(offers.len(), 1);
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        assert_eq!(snippet("héllo", 2), "h");
        assert_eq!(snippet("abc", 10), "abc");
    }
}
