//! Feed Client
//!
//! HTTP client for the valuation data feed: statement payloads, financial
//! events, and the subject reference list. All calls go through the shared
//! rate governor with automatic 429 retry.

use appraisal_core::{
    CallSpec, EventKind, FinancialEvent, ProviderFetch, ProviderPayload, PublisherId,
    StatementPeriod, ValuationError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

pub mod fetcher;
pub mod governor;

pub use fetcher::{FetchOrchestrator, FetchStats};
pub use governor::{BatchPlan, PacingMode, QuotaConfig, RateGovernor};

const DEFAULT_BASE_URL: &str = "https://api.valuefeed.io";

#[derive(Clone)]
pub struct FeedClient {
    api_key: String,
    base_url: String,
    client: Client,
    governor: RateGovernor,
}

impl FeedClient {
    pub fn new(api_key: String) -> Self {
        // Default sized for the standard plan. Free-tier keys should set
        // FEED_RATE_LIMIT=5.
        let rate_limit: usize = std::env::var("FEED_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let base_url =
            std::env::var("FEED_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            base_url,
            client,
            governor: RateGovernor::new(QuotaConfig {
                calls_per_minute: rate_limit,
                max_batch: 50,
            }),
        }
    }

    /// The governor backing this client's admission control. Shared with
    /// the fetch orchestrator for batch planning.
    pub fn governor(&self) -> RateGovernor {
        self.governor.clone()
    }

    /// Send a request with rate limiting and automatic 429 retry.
    async fn send_request(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ValuationError> {
        let request = builder
            .build()
            .map_err(|e| ValuationError::Provider(e.to_string()))?;

        for attempt in 0..3u32 {
            self.governor.acquire().await;
            let req_clone = request
                .try_clone()
                .ok_or_else(|| ValuationError::Provider("Cannot clone request".to_string()))?;
            let response = self
                .client
                .execute(req_clone)
                .await
                .map_err(|e| ValuationError::Provider(e.to_string()))?;

            if response.status().as_u16() != 429 {
                return Ok(response);
            }

            let wait_secs = 15u64;
            tracing::warn!(
                "Feed 429 rate limited, waiting {}s before retry {}/3",
                wait_secs,
                attempt + 1
            );
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
        }

        Err(ValuationError::Provider(
            "Rate limited by feed after 3 retries".to_string(),
        ))
    }

    /// Issue one provider call described by a `CallSpec` and normalize the
    /// response into per-period rows.
    /// Returns an empty payload on 401/403 (endpoint not in the plan).
    pub async fn fetch_payload(
        &self,
        subject: &str,
        call: &CallSpec,
    ) -> Result<ProviderPayload, ValuationError> {
        let url = format!("{}{}", self.base_url, call.path);

        let mut query: Vec<(String, String)> = vec![
            ("apiKey".to_string(), self.api_key.clone()),
            ("subject".to_string(), subject.to_string()),
        ];
        query.extend(call.params.iter().cloned());

        let response = self.send_request(self.client.get(&url).query(&query)).await?;

        let status = response.status().as_u16();
        if status == 403 || status == 401 {
            tracing::info!(
                "Feed endpoint {} not available (HTTP {}), skipping",
                call.path,
                status
            );
            return Ok(ProviderPayload::empty(call.response_key.clone()));
        }
        if !response.status().is_success() {
            return Err(ValuationError::Provider(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let envelope: FeedEnvelope = response
            .json()
            .await
            .map_err(|e| ValuationError::Provider(e.to_string()))?;

        Ok(normalize_payload(&call.response_key, envelope))
    }

    /// List financial events (target publications, earnings releases) for
    /// a subject, newest first. Returns an empty list on 401/403.
    pub async fn get_events(
        &self,
        subject: &str,
        limit: u32,
    ) -> Result<Vec<FinancialEvent>, ValuationError> {
        let url = format!("{}/v1/events", self.base_url);

        let response = self
            .send_request(self.client.get(&url).query(&[
                ("apiKey", self.api_key.as_str()),
                ("subject", subject),
                ("sort", "date.desc"),
                ("limit", &limit.to_string()),
            ]))
            .await?;

        let status = response.status().as_u16();
        if status == 403 || status == 401 {
            tracing::info!("Feed events not available (HTTP {}), skipping", status);
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(ValuationError::Provider(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let body: EventsResponse = response
            .json()
            .await
            .map_err(|e| ValuationError::Provider(e.to_string()))?;

        Ok(body
            .results
            .into_iter()
            .filter_map(|row| event_from_row(subject, row))
            .collect())
    }

    /// List active subjects from the feed's reference endpoint, paginating
    /// automatically up to `max_subjects`.
    pub async fn list_subjects(&self, max_subjects: usize) -> Result<Vec<String>, ValuationError> {
        let mut subjects = Vec::new();
        let mut cursor: Option<String> = None;
        let page_limit = 1000;

        loop {
            let mut builder = self
                .client
                .get(format!("{}/v1/reference/subjects", self.base_url))
                .query(&[
                    ("apiKey", self.api_key.as_str()),
                    ("active", "true"),
                    ("limit", &page_limit.to_string()),
                    ("order", "asc"),
                ]);

            if let Some(ref c) = cursor {
                builder = builder.query(&[("cursor", c.as_str())]);
            }

            let response = self.send_request(builder).await?;
            if !response.status().is_success() {
                break;
            }

            let body: SubjectListResponse = response
                .json()
                .await
                .map_err(|e| ValuationError::Provider(e.to_string()))?;

            for row in &body.results {
                subjects.push(row.symbol.clone());
                if subjects.len() >= max_subjects {
                    return Ok(subjects);
                }
            }

            match body.next_url {
                Some(ref next) => {
                    cursor = next
                        .split("cursor=")
                        .nth(1)
                        .map(|s| s.split('&').next().unwrap_or(s).to_string());
                    if cursor.is_none() {
                        break;
                    }
                }
                None => break,
            }
        }

        Ok(subjects)
    }
}

#[async_trait]
impl ProviderFetch for FeedClient {
    async fn fetch(
        &self,
        subject: &str,
        call: &CallSpec,
    ) -> Result<ProviderPayload, ValuationError> {
        self.fetch_payload(subject, call).await
    }
}

fn normalize_payload(response_key: &str, envelope: FeedEnvelope) -> ProviderPayload {
    let periods = envelope
        .results
        .into_iter()
        .map(|row| StatementPeriod {
            period_start: date_field(&row, "start_date"),
            period_end: date_field(&row, "end_date"),
            fields: row,
        })
        .collect();
    ProviderPayload {
        response_key: response_key.to_string(),
        periods,
    }
}

fn date_field(row: &serde_json::Value, key: &str) -> Option<NaiveDate> {
    row.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn event_from_row(subject: &str, row: EventRow) -> Option<FinancialEvent> {
    let kind = match row.event_type.as_str() {
        "target_publication" => EventKind::TargetPublication,
        "earnings_release" => EventKind::EarningsRelease,
        other => {
            tracing::debug!("Skipping event with unknown type '{}'", other);
            return None;
        }
    };
    let observed_at = DateTime::parse_from_rfc3339(&row.date)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()?;
    let publisher = match (row.firm, row.analyst) {
        (Some(firm), Some(analyst)) => Some(PublisherId::new(firm, analyst)),
        _ => None,
    };
    Some(FinancialEvent {
        id: row.id,
        subject: subject.to_string(),
        kind,
        observed_at,
        publisher,
        target_value: row.price_target,
        reference_value: row.reference_price,
    })
}

// ---- wire types ----

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    results: Vec<EventRow>,
}

#[derive(Debug, Deserialize)]
struct EventRow {
    id: String,
    event_type: String,
    date: String,
    #[serde(default)]
    firm: Option<String>,
    #[serde(default)]
    analyst: Option<String>,
    #[serde(default)]
    price_target: Option<f64>,
    #[serde(default)]
    reference_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SubjectListResponse {
    #[serde(default)]
    results: Vec<SubjectRow>,
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubjectRow {
    symbol: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_payload_extracts_period_dates() {
        let envelope: FeedEnvelope = serde_json::from_str(
            r#"{
                "results": [
                    {
                        "start_date": "2025-01-01",
                        "end_date": "2025-03-31",
                        "revenues": { "value": 100.0 }
                    },
                    { "revenues": { "value": 90.0 } }
                ]
            }"#,
        )
        .unwrap();
        let payload = normalize_payload("incomeStatement", envelope);
        assert_eq!(payload.periods.len(), 2);
        assert_eq!(
            payload.periods[0].period_start,
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
        assert_eq!(payload.periods[0].field("revenues.value"), Some(100.0));
        assert_eq!(payload.periods[1].period_start, None);
        assert_eq!(payload.periods[1].field("revenues.value"), Some(90.0));
    }

    #[test]
    fn test_event_row_maps_to_financial_event() {
        let row = EventRow {
            id: "evt-1".to_string(),
            event_type: "target_publication".to_string(),
            date: "2026-03-01T14:30:00Z".to_string(),
            firm: Some("Hargrove & Lee".to_string()),
            analyst: Some("J. Okafor".to_string()),
            price_target: Some(150.0),
            reference_price: Some(120.0),
        };
        let event = event_from_row("ACME", row).unwrap();
        assert_eq!(event.kind, EventKind::TargetPublication);
        assert_eq!(event.subject, "ACME");
        assert_eq!(event.target_value, Some(150.0));
        let publisher = event.publisher.unwrap();
        assert_eq!(publisher.firm, "Hargrove & Lee");
    }

    #[test]
    fn test_unknown_event_type_skipped() {
        let row = EventRow {
            id: "evt-2".to_string(),
            event_type: "dividend_declaration".to_string(),
            date: "2026-03-01T14:30:00Z".to_string(),
            firm: None,
            analyst: None,
            price_target: None,
            reference_price: None,
        };
        assert!(event_from_row("ACME", row).is_none());
    }

    #[test]
    fn test_bad_event_date_skipped() {
        let row = EventRow {
            id: "evt-3".to_string(),
            event_type: "earnings_release".to_string(),
            date: "not-a-date".to_string(),
            firm: None,
            analyst: None,
            price_target: None,
            reference_price: None,
        };
        assert!(event_from_row("ACME", row).is_none());
    }
}
