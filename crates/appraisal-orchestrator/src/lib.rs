//! Appraisal Orchestrator
//!
//! Per-event glue: gather provider payloads through the fetch layer,
//! evaluate the quantitative and qualitative metric trees, enrich the
//! qualitative side with change-tracker output, then derive position and
//! disparity per tree. Batch runs do tracker Phase 1 and Phase 2 up
//! front so every evaluation sees fresh derived fields.

use appraisal_core::{
    CallSpec, DomainValues, EventKind, FinancialEvent, Position, ProviderFetch, UpdateMode,
    ValuationError, ValuationResult,
};
use chrono::Utc;
use consensus_tracker::{
    ChangeTracker, ConsensusObservation, ConsensusStore, Direction, PartitionKey, RevisionScope,
    UpsertOutcome,
};
use feed_client::{FetchOrchestrator, FetchStats};
use metric_engine::{EvaluationContext, MetricEvaluator, MetricSource};
use std::collections::BTreeSet;

pub use consensus_tracker::DeriveSummary;

/// Metric ids the orchestrator reads back out of evaluated contexts, plus
/// the provider call plan mapping response keys to endpoints.
#[derive(Debug, Clone)]
pub struct ValuationConfig {
    /// Provider calls available to raw-field metrics. Calls whose response
    /// key no metric references are never issued.
    pub calls: Vec<CallSpec>,
    /// Reference price metric for the quantitative tree.
    pub quantitative_reference: String,
    /// Reference price metric for the qualitative tree.
    pub qualitative_reference: String,
    /// Current price metric, shared by both trees.
    pub current_metric: String,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            calls: vec![
                CallSpec::new("incomeStatement", "/v1/statements")
                    .with_param("timeframe", "quarterly")
                    .with_param("limit", "8"),
                CallSpec::new("balanceSheet", "/v1/balance").with_param("limit", "8"),
                CallSpec::new("snapshot", "/v1/snapshot"),
                CallSpec::new("consensus", "/v1/consensus"),
            ],
            quantitative_reference: "fair_value".to_string(),
            qualitative_reference: "analyst_target_mean".to_string(),
            current_metric: "current_price".to_string(),
        }
    }
}

/// Counters and results for one batch run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<ValuationResult>,
    pub events_failed: usize,
    pub observations_recorded: usize,
    pub observations_skipped: usize,
    pub derive: DeriveSummary,
    pub fetch: Option<FetchStats>,
}

pub struct ValuationOrchestrator<P, S> {
    fetcher: FetchOrchestrator<P>,
    evaluator: MetricEvaluator,
    tracker: ChangeTracker<S>,
    config: ValuationConfig,
    /// Call plan pruned to the response keys the registry actually uses.
    resolved_calls: Vec<CallSpec>,
}

impl<P, S> ValuationOrchestrator<P, S>
where
    P: ProviderFetch + 'static,
    S: ConsensusStore + 'static,
{
    pub fn new(
        fetcher: FetchOrchestrator<P>,
        evaluator: MetricEvaluator,
        tracker: ChangeTracker<S>,
        config: ValuationConfig,
    ) -> Self {
        let needed: BTreeSet<&str> = evaluator
            .registry()
            .definitions()
            .filter_map(|def| match &def.source {
                MetricSource::RawField { response_key, .. } => Some(response_key.as_str()),
                _ => None,
            })
            .collect();
        for key in &needed {
            if !config.calls.iter().any(|c| c.response_key == *key) {
                tracing::warn!("No call configured for response key '{}', metrics on it stay null", key);
            }
        }
        let resolved_calls: Vec<CallSpec> = config
            .calls
            .iter()
            .filter(|c| needed.contains(c.response_key.as_str()))
            .cloned()
            .collect();

        Self {
            fetcher,
            evaluator,
            tracker,
            config,
            resolved_calls,
        }
    }

    pub fn tracker(&self) -> &ChangeTracker<S> {
        &self.tracker
    }

    /// Run a whole batch: tracker Phase 1 for every target publication,
    /// one Phase 2 pass over the affected partitions, then governor-paced
    /// evaluation of every event.
    pub async fn process_batch(&self, events: &[FinancialEvent]) -> RunSummary {
        let mut summary = RunSummary::default();

        for event in events {
            let Some(observation) = observation_from_event(event) else {
                continue;
            };
            match self.tracker.record_observation(&observation).await {
                Ok(UpsertOutcome::Skipped) => summary.observations_skipped += 1,
                Ok(_) => summary.observations_recorded += 1,
                Err(e) => {
                    summary.observations_skipped += 1;
                    tracing::warn!("Phase 1 failed for event {}: {}", event.id, e);
                }
            }
        }

        match self.tracker.derive(RevisionScope::AffectedOnly).await {
            Ok(derive) => summary.derive = derive,
            Err(e) => tracing::warn!("Phase 2 pass failed: {}", e),
        }

        let mut index = 0;
        while index < events.len() {
            let plan = self.fetcher.governor().next_batch(events.len() - index).await;
            if plan.size == 0 {
                break;
            }
            let end = (index + plan.size).min(events.len());
            let chunk = &events[index..end];
            tracing::debug!(
                "Evaluating {} events ({} pacing), {} left",
                chunk.len(),
                plan.mode,
                events.len() - end
            );

            let results =
                futures_util::future::join_all(chunk.iter().map(|e| self.process_event(e))).await;
            for (event, result) in chunk.iter().zip(results) {
                match result {
                    Ok(valuation) => summary.results.push(valuation),
                    Err(e) => {
                        summary.events_failed += 1;
                        tracing::warn!(
                            "Valuation failed for event {} ({}): {}",
                            event.id,
                            event.subject,
                            e
                        );
                    }
                }
            }
            index = end;
        }

        summary.fetch = Some(self.fetcher.stats());
        summary
    }

    /// Evaluate one event against both metric trees.
    pub async fn process_event(
        &self,
        event: &FinancialEvent,
    ) -> Result<ValuationResult, ValuationError> {
        let mut ctx = EvaluationContext::new();

        let fetches = self
            .resolved_calls
            .iter()
            .map(|call| self.fetcher.fetch(&event.subject, call));
        for (call, fetched) in self
            .resolved_calls
            .iter()
            .zip(futures_util::future::join_all(fetches).await)
        {
            match fetched {
                Ok(payload) => ctx.add_payload(payload),
                // missing payloads degrade to null metrics, not failures
                Err(e) => tracing::warn!(
                    "Fetch '{}' failed for {}: {}",
                    call.response_key,
                    event.subject,
                    e
                ),
            }
        }

        if let Some(target) = event.target_value {
            ctx.set_custom("event_target", target);
        }
        if let Some(reference) = event.reference_value {
            ctx.set_custom("event_reference", reference);
        }

        match self.consensus_enrichment(&event.subject).await {
            Ok(enrichment) => enrichment.apply(&mut ctx),
            Err(e) => tracing::warn!("Consensus enrichment failed for {}: {}", event.subject, e),
        }

        let value_quantitative = self.evaluator.evaluate(&mut ctx, "quantitative");
        let value_qualitative = self.evaluator.evaluate(&mut ctx, "qualitative");

        let current = ctx.value(&self.config.current_metric);
        let quant_reference = ctx.value(&self.config.quantitative_reference);
        let qual_reference = ctx.value(&self.config.qualitative_reference);

        Ok(ValuationResult {
            event_id: event.id.clone(),
            subject: event.subject.clone(),
            computed_at: Utc::now(),
            value_quantitative,
            value_qualitative,
            position_quantitative: position(quant_reference, current),
            position_qualitative: position(qual_reference, current),
            disparity_quantitative: disparity(quant_reference, current),
            disparity_qualitative: disparity(qual_reference, current),
        })
    }

    /// Roll the newest tracked record of each analyst partition for this
    /// subject into custom metric inputs for the qualitative tree.
    async fn consensus_enrichment(&self, subject: &str) -> Result<Enrichment, ValuationError> {
        let store = self.tracker.store();
        let partitions = store
            .partitions_for_subjects(&[subject.to_string()])
            .await?;

        let mut targets = Vec::new();
        let mut ups = 0usize;
        let mut downs = 0usize;
        for partition in &partitions {
            let records = store.load_partition(partition).await?;
            let Some(newest) = records.first() else {
                continue;
            };
            if let Some(target) = newest.target {
                targets.push(target);
            }
            match newest.derived.direction {
                Some(Direction::Up) => ups += 1,
                Some(Direction::Down) => downs += 1,
                None => {}
            }
        }

        Ok(Enrichment {
            analyst_target_mean: if targets.is_empty() {
                None
            } else {
                Some(targets.iter().sum::<f64>() / targets.len() as f64)
            },
            analyst_count: targets.len(),
            revision_balance: if ups + downs > 0 {
                Some((ups as f64 - downs as f64) / (ups + downs) as f64)
            } else {
                None
            },
        })
    }
}

/// Tracker-derived inputs for the qualitative tree.
#[derive(Debug, Clone, PartialEq)]
struct Enrichment {
    analyst_target_mean: Option<f64>,
    analyst_count: usize,
    revision_balance: Option<f64>,
}

impl Enrichment {
    fn apply(&self, ctx: &mut EvaluationContext) {
        if let Some(mean) = self.analyst_target_mean {
            ctx.set_custom("analyst_target_mean", mean);
        }
        if self.analyst_count > 0 {
            ctx.set_custom("analyst_count", self.analyst_count as f64);
        }
        if let Some(balance) = self.revision_balance {
            ctx.set_custom("revision_balance", balance);
        }
    }
}

fn observation_from_event(event: &FinancialEvent) -> Option<ConsensusObservation> {
    if event.kind != EventKind::TargetPublication {
        return None;
    }
    let publisher = event.publisher.as_ref()?;
    Some(ConsensusObservation {
        partition: PartitionKey::new(
            event.subject.clone(),
            publisher.firm.clone(),
            publisher.analyst.clone(),
        ),
        observed_at: event.observed_at,
        target: event.target_value,
        reference: event.reference_value,
    })
}

/// Directional call from a reference price against the current price.
pub fn position(reference: Option<f64>, current: Option<f64>) -> Position {
    match (reference, current) {
        (Some(r), Some(c)) if r > c => Position::Long,
        (Some(r), Some(c)) if r < c => Position::Short,
        _ => Position::Undefined,
    }
}

/// Signed ratio `reference / current - 1`; null when either side is
/// unavailable or current is zero.
pub fn disparity(reference: Option<f64>, current: Option<f64>) -> Option<f64> {
    match (reference, current) {
        (Some(r), Some(c)) if c != 0.0 => Some(r / c - 1.0),
        _ => None,
    }
}

/// Combine an existing stored tree with freshly computed values.
pub fn merge_values(existing: &DomainValues, fresh: &DomainValues, mode: UpdateMode) -> DomainValues {
    match mode {
        UpdateMode::Replace => fresh.clone(),
        UpdateMode::FillNull => {
            let mut merged = existing.clone();
            for (group_name, fresh_group) in fresh {
                let group = merged.entry(group_name.clone()).or_default();
                for (id, value) in &fresh_group.values {
                    let slot = group.values.entry(id.clone()).or_insert(None);
                    if slot.is_none() {
                        *slot = *value;
                    }
                }
                if group.meta.is_none() {
                    group.meta = fresh_group.meta.clone();
                }
            }
            merged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appraisal_core::{Coverage, ProviderPayload, PublisherId, StatementPeriod};
    use async_trait::async_trait;
    use chrono::DateTime;
    use consensus_tracker::MemoryStore;
    use feed_client::{QuotaConfig, RateGovernor};
    use metric_engine::{MetricDefinitionRecord, MetricRegistry};
    use std::sync::Arc;

    struct StubProvider;

    #[async_trait]
    impl ProviderFetch for StubProvider {
        async fn fetch(
            &self,
            _subject: &str,
            call: &CallSpec,
        ) -> Result<ProviderPayload, ValuationError> {
            let periods = match call.response_key.as_str() {
                "incomeStatement" => (0..4)
                    .map(|i| StatementPeriod {
                        period_start: None,
                        period_end: None,
                        fields: serde_json::json!({ "eps": { "value": 1.0 + i as f64 } }),
                    })
                    .collect(),
                "snapshot" => vec![StatementPeriod {
                    period_start: None,
                    period_end: None,
                    fields: serde_json::json!({ "last_price": 100.0 }),
                }],
                _ => Vec::new(),
            };
            Ok(ProviderPayload {
                response_key: call.response_key.clone(),
                periods,
            })
        }
    }

    fn record(id: &str, domain: &str, source: &str) -> MetricDefinitionRecord {
        MetricDefinitionRecord {
            id: id.to_string(),
            domain: domain.to_string(),
            source: source.to_string(),
            response_key: None,
            api_field_path: None,
            base_metric_id: None,
            aggregation_kind: None,
            aggregation_params: None,
            expression: None,
        }
    }

    fn test_registry() -> MetricRegistry {
        let mut eps = record("eps", "quantitative-profitability", "rawField");
        eps.response_key = Some("incomeStatement".to_string());
        eps.api_field_path = Some("eps.value".to_string());

        let mut ttm_eps = record("ttm_eps", "quantitative-profitability", "aggregation");
        ttm_eps.base_metric_id = Some("eps".to_string());
        ttm_eps.aggregation_kind = Some("trailing-twelve-month".to_string());

        let mut fair_value = record("fair_value", "quantitative-valuation", "expression");
        fair_value.expression = Some("ttm_eps * 12".to_string());

        let mut current_price = record("current_price", "quantitative-valuation", "rawField");
        current_price.response_key = Some("snapshot".to_string());
        current_price.api_field_path = Some("last_price".to_string());

        let target_mean = record("analyst_target_mean", "qualitative-consensus", "custom");
        let count = record("analyst_count", "qualitative-consensus", "custom");
        let balance = record("revision_balance", "qualitative-consensus", "custom");

        MetricRegistry::from_records(vec![
            eps,
            ttm_eps,
            fair_value,
            current_price,
            target_mean,
            count,
            balance,
        ])
        .unwrap()
    }

    fn orchestrator() -> ValuationOrchestrator<StubProvider, MemoryStore> {
        let governor = RateGovernor::new(QuotaConfig::default());
        let fetcher = FetchOrchestrator::new(Arc::new(StubProvider), governor);
        let evaluator = MetricEvaluator::new(Arc::new(test_registry())).unwrap();
        let tracker = ChangeTracker::new(Arc::new(MemoryStore::new()));
        ValuationOrchestrator::new(fetcher, evaluator, tracker, ValuationConfig::default())
    }

    fn target_event(id: &str, day: i64, target: f64) -> FinancialEvent {
        FinancialEvent {
            id: id.to_string(),
            subject: "ACME".to_string(),
            kind: EventKind::TargetPublication,
            observed_at: DateTime::from_timestamp(day * 86_400, 0).unwrap(),
            publisher: Some(PublisherId::new("Hargrove & Lee", "J. Okafor")),
            target_value: Some(target),
            reference_value: Some(100.0),
        }
    }

    #[test]
    fn test_position_and_disparity() {
        assert_eq!(position(Some(110.0), Some(100.0)), Position::Long);
        assert_eq!(position(Some(90.0), Some(100.0)), Position::Short);
        assert_eq!(position(Some(100.0), Some(100.0)), Position::Undefined);
        assert_eq!(position(None, Some(100.0)), Position::Undefined);
        assert_eq!(position(Some(110.0), None), Position::Undefined);

        assert!((disparity(Some(110.0), Some(100.0)).unwrap() - 0.10).abs() < 1e-12);
        assert_eq!(disparity(Some(100.0), Some(100.0)), Some(0.0));
        assert_eq!(disparity(Some(110.0), Some(0.0)), None);
        assert_eq!(disparity(None, Some(100.0)), None);
    }

    #[test]
    fn test_merge_fill_null_keeps_existing_values() {
        let mut existing: DomainValues = DomainValues::new();
        let group = existing.entry("valuation".to_string()).or_default();
        group.values.insert("fair_value".to_string(), Some(42.0));
        group.values.insert("current_price".to_string(), None);

        let mut fresh: DomainValues = DomainValues::new();
        let fresh_group = fresh.entry("valuation".to_string()).or_default();
        fresh_group
            .values
            .insert("fair_value".to_string(), Some(99.0));
        fresh_group
            .values
            .insert("current_price".to_string(), Some(100.0));
        fresh_group.values.insert("extra".to_string(), Some(1.0));

        let merged = merge_values(&existing, &fresh, UpdateMode::FillNull);
        let out = &merged["valuation"];
        assert_eq!(out.values["fair_value"], Some(42.0));
        assert_eq!(out.values["current_price"], Some(100.0));
        assert_eq!(out.values["extra"], Some(1.0));

        let replaced = merge_values(&existing, &fresh, UpdateMode::Replace);
        assert_eq!(replaced["valuation"].values["fair_value"], Some(99.0));
    }

    #[tokio::test]
    async fn test_process_event_builds_both_trees() {
        let orch = orchestrator();
        let event = target_event("evt-1", 3, 110.0);

        let result = orch.process_event(&event).await.unwrap();

        // ttm_eps = 1+2+3+4, fair_value = 10 * 12
        let profitability = &result.value_quantitative["profitability"];
        assert_eq!(profitability.values["ttm_eps"], Some(10.0));
        assert_eq!(profitability.meta.as_ref().unwrap().coverage, Coverage::Full);
        let valuation = &result.value_quantitative["valuation"];
        assert_eq!(valuation.values["fair_value"], Some(120.0));

        // fair_value 120 vs current 100
        assert_eq!(result.position_quantitative, Position::Long);
        assert!((result.disparity_quantitative.unwrap() - 0.20).abs() < 1e-12);

        // no tracked analysts yet: qualitative side is undefined
        assert_eq!(result.position_qualitative, Position::Undefined);
        assert_eq!(result.disparity_qualitative, None);
    }

    #[tokio::test]
    async fn test_process_batch_enriches_qualitative_from_tracker() {
        let orch = orchestrator();
        let events = vec![target_event("evt-1", 1, 100.0), target_event("evt-2", 3, 110.0)];

        let summary = orch.process_batch(&events).await;

        assert_eq!(summary.observations_recorded, 2);
        assert_eq!(summary.derive.partitions_processed, 1);
        assert_eq!(summary.derive.records_updated, 1);
        assert_eq!(summary.events_failed, 0);
        assert_eq!(summary.results.len(), 2);

        let result = &summary.results[0];
        let consensus = &result.value_qualitative["consensus"];
        // one partition, newest target 110
        assert_eq!(consensus.values["analyst_target_mean"], Some(110.0));
        assert_eq!(consensus.values["analyst_count"], Some(1.0));
        // newest record revised up
        assert_eq!(consensus.values["revision_balance"], Some(1.0));

        // analyst mean 110 vs current 100
        assert_eq!(result.position_qualitative, Position::Long);
        assert!((result.disparity_qualitative.unwrap() - 0.10).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_batch_deduplicates_subject_fetches() {
        let orch = orchestrator();
        let events = vec![
            target_event("evt-1", 1, 100.0),
            target_event("evt-2", 2, 105.0),
            target_event("evt-3", 3, 110.0),
        ];

        let summary = orch.process_batch(&events).await;
        let fetch = summary.fetch.unwrap();
        // one subject, two resolved calls: everything past the first event
        // is served from the run cache
        assert_eq!(fetch.upstream_calls, 2);
        assert_eq!(fetch.requests, 6);
    }
}
