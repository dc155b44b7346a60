//! Metric Engine
//!
//! Declarative metric catalog and evaluation. Definitions arrive as loose
//! feed records, get parsed into typed sources (raw field, aggregation,
//! expression, custom), and are evaluated in dependency order with
//! null-propagating arithmetic.

pub mod aggregation;
pub mod evaluator;
pub mod expression;
pub mod graph;
pub mod registry;

pub use aggregation::{AggregateOutcome, SeriesPoint};
pub use evaluator::{EvaluationContext, MetricEvaluator};
pub use expression::{BinaryOp, Expr};
pub use graph::MetricGraph;
pub use registry::{
    AggregationKind, MetricDefinition, MetricDefinitionRecord, MetricRegistry, MetricSource,
};
