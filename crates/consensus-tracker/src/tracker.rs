//! The two-phase change tracker.
//!
//! Phase 1 (`record_observation`) upserts current values and marks the
//! partition touched. Phase 2 (`derive`) resolves a scope to a partition
//! set, then recomputes derived fields per partition: records ordered by
//! timestamp descending, each record's previous values taken from the
//! next-older record, the oldest left untouched. Partitions share no
//! state, so they run concurrently.

use appraisal_core::ValuationError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::scope::RevisionScope;
use crate::{
    ConsensusObservation, ConsensusRecord, ConsensusStore, DerivedFields, Direction, PartitionKey,
    UpsertOutcome,
};

/// Outcome counters for one derive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeriveSummary {
    pub partitions_processed: usize,
    pub records_updated: usize,
    pub records_skipped: usize,
    pub partitions_failed: usize,
}

pub struct ChangeTracker<S> {
    store: Arc<S>,
    touched: Mutex<HashSet<PartitionKey>>,
}

impl<S: ConsensusStore + 'static> ChangeTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            touched: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Phase 1: write current values for one observation. Ambiguous
    /// identity matches are reported and skipped, and do not mark the
    /// partition as touched.
    pub async fn record_observation(
        &self,
        observation: &ConsensusObservation,
    ) -> Result<UpsertOutcome, ValuationError> {
        let outcome = self.store.upsert_current(observation).await?;
        match outcome {
            UpsertOutcome::Skipped => {
                tracing::warn!(
                    "Ambiguous consensus record for {} at {}, skipping",
                    observation.partition,
                    observation.observed_at
                );
            }
            UpsertOutcome::Inserted | UpsertOutcome::Updated => {
                self.touched
                    .lock()
                    .await
                    .insert(observation.partition.clone());
            }
        }
        Ok(outcome)
    }

    /// Phase 2: derive previous/direction/delta fields for every partition
    /// the scope selects. Each partition is processed exactly once per
    /// call; `AffectedOnly` drains the touched set.
    pub async fn derive(&self, scope: RevisionScope) -> Result<DeriveSummary, ValuationError> {
        let selected: Vec<PartitionKey> = match scope {
            RevisionScope::AffectedOnly => {
                let mut touched = self.touched.lock().await;
                touched.drain().collect()
            }
            RevisionScope::All => self.store.all_partitions().await?,
            RevisionScope::BySubject { subjects } => {
                self.store.partitions_for_subjects(&subjects).await?
            }
            RevisionScope::ByDateRange { from, to } => {
                self.store.partitions_in_range(from, to).await?
            }
            RevisionScope::ByPartitions { partitions } => partitions,
        };
        // one pass per partition no matter how the scope was phrased
        let unique: BTreeSet<PartitionKey> = selected.into_iter().collect();

        let mut join_set = JoinSet::new();
        for partition in unique {
            let store = Arc::clone(&self.store);
            join_set.spawn(async move {
                let result = derive_partition(store.as_ref(), &partition).await;
                (partition, result)
            });
        }

        let mut summary = DeriveSummary::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok((updated, skipped)))) => {
                    summary.partitions_processed += 1;
                    summary.records_updated += updated;
                    summary.records_skipped += skipped;
                }
                Ok((partition, Err(e))) => {
                    summary.partitions_failed += 1;
                    tracing::warn!("Phase 2 failed for {}: {}", partition, e);
                }
                Err(e) => {
                    summary.partitions_failed += 1;
                    tracing::warn!("Phase 2 task failed: {}", e);
                }
            }
        }
        Ok(summary)
    }
}

/// Recompute derived fields for one partition. Treated as an atomic unit
/// of work: all records are computed before being written back in order.
async fn derive_partition<S: ConsensusStore + ?Sized>(
    store: &S,
    partition: &PartitionKey,
) -> Result<(usize, usize), ValuationError> {
    let records = store.load_partition(partition).await?;

    // compute everything first, write after: a failed load never leaves a
    // half-derived partition behind
    let updates: Vec<(DateTime<Utc>, DerivedFields)> = records
        .windows(2)
        .map(|pair| (pair[0].observed_at, derive_fields(&pair[0], &pair[1])))
        .collect();

    let mut updated = 0;
    let mut skipped = 0;
    for (observed_at, derived) in updates {
        if store.write_derived(partition, observed_at, &derived).await? {
            updated += 1;
        } else {
            tracing::warn!(
                "Derived write skipped for {} at {} (missing or ambiguous)",
                partition,
                observed_at
            );
            skipped += 1;
        }
    }
    Ok((updated, skipped))
}

/// Derived fields for `current` given the next-older record in the same
/// partition.
fn derive_fields(current: &ConsensusRecord, older: &ConsensusRecord) -> DerivedFields {
    let previous_target = older.target;
    let previous_reference = older.reference;
    let direction = match (current.target, previous_target) {
        (Some(now), Some(prev)) if now > prev => Some(Direction::Up),
        (Some(now), Some(prev)) if now < prev => Some(Direction::Down),
        _ => None,
    };
    let delta = match (current.target, previous_target) {
        (Some(now), Some(prev)) => Some(now - prev),
        _ => None,
    };
    let delta_pct = match (delta, previous_target) {
        (Some(d), Some(prev)) if prev != 0.0 => Some(d / prev),
        _ => None,
    };
    DerivedFields {
        previous_target,
        previous_reference,
        direction,
        delta,
        delta_pct,
    }
}
