//! Metric catalog loading.
//!
//! Definitions arrive as loose feed records (extra fields tolerated, shape
//! only checked per kind). Records are converted once into typed
//! definitions; anything unconvertible becomes an `Invalid` source that
//! evaluates to null, with a single warning at load time.

use appraisal_core::ValuationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::expression::Expr;

/// Aggregation policy over a base metric's per-period series.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationKind {
    /// Sum of the most recent four periods, annualized when short.
    TrailingTwelveMonth,
    /// Mean of the most recent `periods` values.
    TrailingAverage { periods: usize },
    /// Most recent non-null value.
    LastValue,
}

impl AggregationKind {
    fn parse(kind: &str, params: Option<&serde_json::Value>) -> Option<Self> {
        match kind {
            "trailing-twelve-month" | "trailingTwelveMonth" | "ttm" => {
                Some(Self::TrailingTwelveMonth)
            }
            "trailing-average" | "trailingAverage" => {
                let periods = params
                    .and_then(|p| p.get("periods"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(4) as usize;
                Some(Self::TrailingAverage {
                    periods: periods.max(1),
                })
            }
            "last-value" | "lastValue" => Some(Self::LastValue),
            _ => None,
        }
    }
}

/// Where a metric's value comes from.
#[derive(Debug, Clone)]
pub enum MetricSource {
    /// A field path read out of a cached provider payload.
    RawField {
        response_key: String,
        field_path: String,
    },
    /// An aggregation over another metric's per-period series.
    Aggregation {
        base_metric: String,
        kind: AggregationKind,
    },
    /// An arithmetic formula over other metric ids.
    Expression { formula: Expr },
    /// A value supplied out-of-band for each evaluation.
    Custom,
    /// Unconvertible record; always evaluates to null.
    Invalid { reason: String },
}

/// One typed entry of the metric catalog.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    pub id: String,
    pub domain: String,
    pub source: MetricSource,
}

impl MetricDefinition {
    /// Domain prefix before the first '-'. Selects which output tree the
    /// metric lands in.
    pub fn tree(&self) -> &str {
        self.domain.split_once('-').map(|(t, _)| t).unwrap_or(&self.domain)
    }

    /// Domain suffix after the first '-', or "general" when the domain has
    /// no suffix. Selects the group within the output tree.
    pub fn group(&self) -> &str {
        self.domain.split_once('-').map(|(_, g)| g).unwrap_or("general")
    }

    /// Metric ids this definition reads.
    pub fn references(&self) -> Vec<String> {
        match &self.source {
            MetricSource::Expression { formula } => formula.references().into_iter().collect(),
            MetricSource::Aggregation { base_metric, .. } => vec![base_metric.clone()],
            _ => Vec::new(),
        }
    }
}

/// Wire shape of one catalog record. Kind-specific fields are optional
/// here and validated during conversion so a single malformed record
/// cannot poison the whole catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinitionRecord {
    pub id: String,
    pub domain: String,
    pub source: String,
    #[serde(default)]
    pub response_key: Option<String>,
    #[serde(default)]
    pub api_field_path: Option<String>,
    #[serde(default)]
    pub base_metric_id: Option<String>,
    #[serde(default)]
    pub aggregation_kind: Option<String>,
    #[serde(default)]
    pub aggregation_params: Option<serde_json::Value>,
    #[serde(default)]
    pub expression: Option<String>,
}

impl MetricDefinitionRecord {
    fn into_definition(self) -> MetricDefinition {
        let source = match self.source.as_str() {
            "rawField" => match (self.response_key, self.api_field_path) {
                (Some(response_key), Some(field_path)) => MetricSource::RawField {
                    response_key,
                    field_path,
                },
                _ => MetricSource::Invalid {
                    reason: "rawField requires responseKey and apiFieldPath".to_string(),
                },
            },
            "aggregation" => match (self.base_metric_id, self.aggregation_kind) {
                (Some(base_metric), Some(kind_name)) => {
                    match AggregationKind::parse(&kind_name, self.aggregation_params.as_ref()) {
                        Some(kind) => MetricSource::Aggregation { base_metric, kind },
                        None => MetricSource::Invalid {
                            reason: format!("unknown aggregation kind '{}'", kind_name),
                        },
                    }
                }
                _ => MetricSource::Invalid {
                    reason: "aggregation requires baseMetricId and aggregationKind".to_string(),
                },
            },
            "expression" => match self.expression {
                Some(formula) => match Expr::parse(&formula) {
                    Ok(expr) => MetricSource::Expression { formula: expr },
                    Err(e) => MetricSource::Invalid {
                        reason: e.to_string(),
                    },
                },
                None => MetricSource::Invalid {
                    reason: "expression requires a formula".to_string(),
                },
            },
            "custom" => MetricSource::Custom,
            other => MetricSource::Invalid {
                reason: format!("unknown source kind '{}'", other),
            },
        };
        MetricDefinition {
            id: self.id,
            domain: self.domain,
            source,
        }
    }
}

/// The metric catalog for one run. Loaded once, then read-only.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    defs: BTreeMap<String, MetricDefinition>,
}

impl MetricRegistry {
    /// Convert feed records into the typed catalog. Unconvertible records
    /// are kept as `Invalid` (null at evaluation) and warned about here,
    /// once. Duplicate ids are a configuration error.
    pub fn from_records(
        records: Vec<MetricDefinitionRecord>,
    ) -> Result<Self, ValuationError> {
        let mut defs = BTreeMap::new();
        for record in records {
            let def = record.into_definition();
            if defs.contains_key(&def.id) {
                return Err(ValuationError::InvalidConfiguration(format!(
                    "duplicate metric id '{}'",
                    def.id
                )));
            }
            defs.insert(def.id.clone(), def);
        }

        // Aggregations must sit on a raw-field or custom base so the base
        // has a per-period series to aggregate. Checked after all records
        // are in so declaration order does not matter.
        let mut demoted: Vec<(String, String)> = Vec::new();
        for def in defs.values() {
            if let MetricSource::Aggregation { base_metric, .. } = &def.source {
                let reason = match defs.get(base_metric) {
                    None => Some(format!("aggregation base '{}' is not defined", base_metric)),
                    Some(base) => match base.source {
                        MetricSource::RawField { .. } | MetricSource::Custom => None,
                        _ => Some(format!(
                            "aggregation base '{}' must be a rawField or custom metric",
                            base_metric
                        )),
                    },
                };
                if let Some(reason) = reason {
                    demoted.push((def.id.clone(), reason));
                }
            }
        }
        for (id, reason) in demoted {
            if let Some(def) = defs.get_mut(&id) {
                def.source = MetricSource::Invalid { reason };
            }
        }

        for def in defs.values() {
            if let MetricSource::Invalid { reason } = &def.source {
                tracing::warn!("Skipping metric '{}': {}", def.id, reason);
            }
        }

        Ok(Self { defs })
    }

    pub fn get(&self, id: &str) -> Option<&MetricDefinition> {
        self.defs.get(id)
    }

    /// All definitions in id order.
    pub fn definitions(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.defs.values()
    }

    /// Definitions whose domain prefix matches the given tree.
    pub fn tree_members<'a>(&'a self, tree: &'a str) -> impl Iterator<Item = &'a MetricDefinition> {
        self.defs.values().filter(move |d| d.tree() == tree)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
