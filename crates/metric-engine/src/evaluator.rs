//! Metric evaluation.
//!
//! A `MetricEvaluator` is built once per run from the registry (the graph
//! build front-loads cycle and reference errors), then evaluates any number
//! of events. Each event gets its own `EvaluationContext` carrying the raw
//! payloads, caller-supplied custom values, and the memo of computed ids.

use appraisal_core::{Coverage, DomainValues, GroupMeta, ProviderPayload};
use appraisal_core::ValuationError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::aggregation::{self, AggregateOutcome, SeriesPoint};
use crate::graph::MetricGraph;
use crate::registry::{AggregationKind, MetricRegistry, MetricSource};

/// Per-event inputs and memoized results. Created per event, discarded
/// after use; evaluating both trees against one context shares the memo.
#[derive(Debug, Default)]
pub struct EvaluationContext {
    payloads: HashMap<String, ProviderPayload>,
    custom: HashMap<String, f64>,
    memo: HashMap<String, Option<f64>>,
    series: HashMap<String, Vec<SeriesPoint>>,
    outcomes: HashMap<String, AggregateOutcome>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a raw provider payload under its response key.
    pub fn add_payload(&mut self, payload: ProviderPayload) {
        self.payloads.insert(payload.response_key.clone(), payload);
    }

    /// Supply a value for a custom-sourced metric.
    pub fn set_custom(&mut self, id: impl Into<String>, value: f64) {
        self.custom.insert(id.into(), value);
    }

    /// Computed value of a metric, if it has been evaluated in this context.
    pub fn value(&self, id: &str) -> Option<f64> {
        self.memo.get(id).copied().flatten()
    }
}

/// Resolves metric values for one registry.
pub struct MetricEvaluator {
    registry: Arc<MetricRegistry>,
    graph: MetricGraph,
}

impl MetricEvaluator {
    /// Build the dependency graph for the registry. Cyclic catalogs and
    /// expressions referencing unknown ids fail here, before any event is
    /// touched.
    pub fn new(registry: Arc<MetricRegistry>) -> Result<Self, ValuationError> {
        let graph = MetricGraph::build(&registry)?;
        Ok(Self { registry, graph })
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Evaluate every metric whose domain prefix matches `tree`, plus all
    /// transitive dependencies, and group the tree's results by domain
    /// suffix. Group metadata is attached when the group contains at least
    /// one aggregation-derived metric.
    pub fn evaluate(&self, ctx: &mut EvaluationContext, tree: &str) -> DomainValues {
        let roots: Vec<String> = self
            .registry
            .tree_members(tree)
            .map(|d| d.id.clone())
            .collect();
        let needed = self.graph.closure(roots);

        for id in self.graph.order() {
            if !needed.contains(id) || ctx.memo.contains_key(id) {
                continue;
            }
            self.evaluate_metric(ctx, id);
        }

        let mut out: DomainValues = BTreeMap::new();
        for def in self.registry.tree_members(tree) {
            let group = out.entry(def.group().to_string()).or_default();
            group
                .values
                .insert(def.id.clone(), ctx.memo.get(&def.id).copied().flatten());
            if let Some(outcome) = ctx.outcomes.get(&def.id) {
                merge_meta(&mut group.meta, outcome);
            }
        }
        out
    }

    fn evaluate_metric(&self, ctx: &mut EvaluationContext, id: &str) {
        let def = match self.registry.get(id) {
            Some(def) => def,
            None => return,
        };
        let value = match &def.source {
            MetricSource::RawField {
                response_key,
                field_path,
            } => {
                let series = raw_series(ctx, response_key, field_path);
                let scalar = series.iter().find_map(|p| p.value);
                ctx.series.insert(id.to_string(), series);
                scalar
            }
            MetricSource::Aggregation { base_metric, kind } => {
                let outcome = aggregate(ctx, base_metric, kind);
                let value = outcome.value;
                ctx.outcomes.insert(id.to_string(), outcome);
                value
            }
            MetricSource::Expression { formula } => {
                formula.evaluate(&|operand| ctx.memo.get(operand).copied().flatten())
            }
            MetricSource::Custom => ctx.custom.get(id).copied(),
            MetricSource::Invalid { .. } => None,
        };
        ctx.memo.insert(id.to_string(), value);
    }
}

/// Per-period series for a raw-field metric. An absent payload gives an
/// empty series, which downstream reads as null.
fn raw_series(ctx: &EvaluationContext, response_key: &str, field_path: &str) -> Vec<SeriesPoint> {
    match ctx.payloads.get(response_key) {
        Some(payload) => payload
            .periods
            .iter()
            .map(|p| SeriesPoint::new(p.period_start, p.period_end, p.field(field_path)))
            .collect(),
        None => Vec::new(),
    }
}

fn aggregate(ctx: &EvaluationContext, base_metric: &str, kind: &AggregationKind) -> AggregateOutcome {
    // a raw-field base was evaluated earlier in topological order and left
    // its series behind; a custom base widens to a single synthetic period
    let series: Vec<SeriesPoint> = match ctx.series.get(base_metric) {
        Some(points) => points.clone(),
        None => match ctx.custom.get(base_metric) {
            Some(value) => vec![SeriesPoint::new(None, None, Some(*value))],
            None => Vec::new(),
        },
    };
    match kind {
        AggregationKind::TrailingTwelveMonth => aggregation::trailing_twelve_month(&series),
        AggregationKind::TrailingAverage { periods } => {
            aggregation::trailing_average(&series, *periods)
        }
        AggregationKind::LastValue => aggregation::last_value(&series),
    }
}

/// Fold one aggregation outcome into a group's metadata block: widest
/// period envelope, worst coverage, largest sample count.
fn merge_meta(meta: &mut Option<GroupMeta>, outcome: &AggregateOutcome) {
    match meta {
        None => {
            *meta = Some(GroupMeta {
                period_start: outcome.period_start,
                period_end: outcome.period_end,
                coverage: outcome.coverage,
                sample_count: outcome.sample_count,
            });
        }
        Some(existing) => {
            existing.period_start = match (existing.period_start, outcome.period_start) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            existing.period_end = match (existing.period_end, outcome.period_end) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            existing.coverage = merge_coverage(existing.coverage, outcome.coverage);
            existing.sample_count = existing.sample_count.max(outcome.sample_count);
        }
    }
}

fn merge_coverage(a: Coverage, b: Coverage) -> Coverage {
    match (a, b) {
        (Coverage::Full, Coverage::Full) => Coverage::Full,
        (Coverage::NoData, Coverage::NoData) => Coverage::NoData,
        _ => Coverage::Partial,
    }
}
