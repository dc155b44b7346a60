//! Dependency graph over the metric catalog.
//!
//! Built once per run from the registry. Edges run from each definition to
//! every metric id it references; Kahn's algorithm yields the evaluation
//! order and detects cycles.

use appraisal_core::ValuationError;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::registry::{MetricRegistry, MetricSource};

/// Evaluation order and adjacency for one registry.
#[derive(Debug)]
pub struct MetricGraph {
    /// Every metric id, dependencies before dependents.
    order: Vec<String>,
    /// Direct dependencies per metric id.
    deps: HashMap<String, BTreeSet<String>>,
}

impl MetricGraph {
    /// Build adjacency and a topological order. Fails on an expression
    /// referencing an id the registry does not contain, and on any cycle.
    pub fn build(registry: &MetricRegistry) -> Result<Self, ValuationError> {
        let mut in_degree: BTreeMap<String, usize> = registry
            .definitions()
            .map(|d| (d.id.clone(), 0))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut deps: HashMap<String, BTreeSet<String>> = HashMap::new();

        for def in registry.definitions() {
            let mut direct = BTreeSet::new();
            match &def.source {
                MetricSource::Expression { formula } => {
                    for reference in formula.references() {
                        if registry.get(&reference).is_none() {
                            return Err(ValuationError::UnknownMetricReference {
                                metric: def.id.clone(),
                                reference,
                            });
                        }
                        direct.insert(reference);
                    }
                }
                MetricSource::Aggregation { base_metric, .. } => {
                    // registry loading demotes aggregations with missing
                    // bases, so the base is present here
                    direct.insert(base_metric.clone());
                }
                _ => {}
            }
            if let Some(count) = in_degree.get_mut(&def.id) {
                *count = direct.len();
            }
            for dep in &direct {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(def.id.clone());
            }
            deps.insert(def.id.clone(), direct);
        }

        let mut queue: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = queue.pop_front() {
            if let Some(children) = dependents.get(&id) {
                for child in children {
                    if let Some(count) = in_degree.get_mut(child) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(child.clone());
                        }
                    }
                }
            }
            order.push(id);
        }

        if order.len() < in_degree.len() {
            // whatever never reached zero in-degree sits on a cycle;
            // report the smallest id for a stable message
            let offender = in_degree
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(id, _)| id.clone())
                .next()
                .unwrap_or_default();
            return Err(ValuationError::CyclicDependency(offender));
        }

        Ok(Self { order, deps })
    }

    /// All metric ids, dependencies before dependents.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// The given ids plus everything they transitively depend on.
    pub fn closure<I>(&self, roots: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut needed = BTreeSet::new();
        let mut stack: Vec<String> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            if needed.insert(id.clone()) {
                if let Some(direct) = self.deps.get(&id) {
                    stack.extend(direct.iter().cloned());
                }
            }
        }
        needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricDefinitionRecord;

    fn raw(id: &str) -> MetricDefinitionRecord {
        MetricDefinitionRecord {
            id: id.to_string(),
            domain: "quantitative-valuation".to_string(),
            source: "rawField".to_string(),
            response_key: Some("incomeStatement".to_string()),
            api_field_path: Some(format!("{}.value", id)),
            base_metric_id: None,
            aggregation_kind: None,
            aggregation_params: None,
            expression: None,
        }
    }

    fn expr(id: &str, formula: &str) -> MetricDefinitionRecord {
        let mut record = raw(id);
        record.source = "expression".to_string();
        record.response_key = None;
        record.api_field_path = None;
        record.expression = Some(formula.to_string());
        record
    }

    #[test]
    fn test_order_puts_dependencies_first() {
        let registry = MetricRegistry::from_records(vec![
            expr("c", "b / 2"),
            expr("b", "a * 4"),
            raw("a"),
        ])
        .unwrap();
        let graph = MetricGraph::build(&registry).unwrap();
        let position = |id: &str| graph.order().iter().position(|x| x == id).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("b") < position("c"));
    }

    #[test]
    fn test_cycle_detected() {
        let registry = MetricRegistry::from_records(vec![
            expr("a", "b + 1"),
            expr("b", "a + 1"),
        ])
        .unwrap();
        match MetricGraph::build(&registry) {
            Err(ValuationError::CyclicDependency(id)) => assert_eq!(id, "a"),
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let registry = MetricRegistry::from_records(vec![expr("a", "a + 1")]).unwrap();
        assert!(matches!(
            MetricGraph::build(&registry),
            Err(ValuationError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_cycle_does_not_mask_acyclic_part() {
        // nodes outside the cycle still drain; the error names a cycle member
        let registry = MetricRegistry::from_records(vec![
            raw("x"),
            expr("ok", "x * 2"),
            expr("p", "q + 1"),
            expr("q", "p + 1"),
        ])
        .unwrap();
        match MetricGraph::build(&registry) {
            Err(ValuationError::CyclicDependency(id)) => assert_eq!(id, "p"),
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let registry = MetricRegistry::from_records(vec![expr("a", "ghost * 2")]).unwrap();
        match MetricGraph::build(&registry) {
            Err(ValuationError::UnknownMetricReference { metric, reference }) => {
                assert_eq!(metric, "a");
                assert_eq!(reference, "ghost");
            }
            other => panic!("expected unknown reference error, got {:?}", other),
        }
    }

    #[test]
    fn test_closure_collects_transitive_deps() {
        let registry = MetricRegistry::from_records(vec![
            raw("a"),
            raw("unrelated"),
            expr("b", "a * 4"),
            expr("c", "b / 2"),
        ])
        .unwrap();
        let graph = MetricGraph::build(&registry).unwrap();
        let needed = graph.closure(vec!["c".to_string()]);
        assert!(needed.contains("a"));
        assert!(needed.contains("b"));
        assert!(needed.contains("c"));
        assert!(!needed.contains("unrelated"));
    }
}
