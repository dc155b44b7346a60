use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of ingested financial event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TargetPublication,
    EarningsRelease,
}

/// Publisher identity for consensus partitioning (firm + analyst)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublisherId {
    pub firm: String,
    pub analyst: String,
}

impl PublisherId {
    pub fn new(firm: impl Into<String>, analyst: impl Into<String>) -> Self {
        Self {
            firm: firm.into(),
            analyst: analyst.into(),
        }
    }
}

/// A time-stamped financial event from the upstream feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialEvent {
    pub id: String,
    pub subject: String,
    pub kind: EventKind,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub publisher: Option<PublisherId>,
    /// Published target value (price target for analyst publications)
    #[serde(default)]
    pub target_value: Option<f64>,
    /// Reference value carried by the event itself (e.g. price at publication)
    #[serde(default)]
    pub reference_value: Option<f64>,
}

/// One upstream provider call, identified by its response key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSpec {
    /// Provider-call identity; rawField definitions address payloads by this key
    pub response_key: String,
    /// URL path on the provider, e.g. "/v1/reference/statements"
    pub path: String,
    /// Query parameters beyond subject and auth
    #[serde(default)]
    pub params: Vec<(String, String)>,
}

impl CallSpec {
    pub fn new(response_key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            response_key: response_key.into(),
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// One reporting period of a normalized provider payload.
/// Single-shot responses (snapshots, consensus summaries) are a single period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementPeriod {
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    /// Path-addressable fields for this period
    pub fields: serde_json::Value,
}

impl StatementPeriod {
    /// Resolve a dotted field path against this period, e.g.
    /// "income_statement.revenues.value". Missing or non-numeric ⇒ None.
    pub fn field(&self, path: &str) -> Option<f64> {
        json_path(&self.fields, path)
    }
}

/// Normalized provider response: ordered newest period first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayload {
    pub response_key: String,
    pub periods: Vec<StatementPeriod>,
}

impl ProviderPayload {
    pub fn empty(response_key: impl Into<String>) -> Self {
        Self {
            response_key: response_key.into(),
            periods: Vec::new(),
        }
    }
}

/// Resolve a dotted path into a JSON value, returning a number if one is there
pub fn json_path(value: &serde_json::Value, path: &str) -> Option<f64> {
    let mut cursor = value;
    for step in path.split('.') {
        cursor = cursor.get(step)?;
    }
    cursor.as_f64()
}

/// How much of the requested window an aggregation actually covered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Coverage {
    Full,
    Partial,
    NoData,
}

/// Metadata attached to a domain group that contains aggregation-derived metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    pub coverage: Coverage,
    pub sample_count: usize,
}

/// One output domain group: metric id → value, plus aggregation metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainGroup {
    pub values: BTreeMap<String, Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<GroupMeta>,
}

/// Value tree for one domain set, keyed by group (domain suffix)
pub type DomainValues = BTreeMap<String, DomainGroup>;

/// Directional call derived from reference vs current price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Long,
    Short,
    Undefined,
}

/// Caller-selected write semantics for persisted value trees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Merge only into currently-absent leaf values
    FillNull,
    /// Overwrite the whole tree
    Replace,
}

/// Per-event output of the valuation orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationResult {
    pub event_id: String,
    pub subject: String,
    pub computed_at: DateTime<Utc>,
    pub value_quantitative: DomainValues,
    pub value_qualitative: DomainValues,
    pub position_quantitative: Position,
    pub position_qualitative: Position,
    pub disparity_quantitative: Option<f64>,
    pub disparity_qualitative: Option<f64>,
}
