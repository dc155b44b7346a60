//! In-memory consensus store, used by tests and dry runs.

use appraisal_core::ValuationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    ConsensusObservation, ConsensusRecord, ConsensusStore, DerivedFields, PartitionKey,
    UpsertOutcome,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: DashMap<PartitionKey, Vec<ConsensusRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record verbatim, bypassing the identity check. Lets tests
    /// construct duplicate-identity states that `upsert_current` refuses
    /// to create.
    pub fn seed(&self, record: ConsensusRecord) {
        self.partitions
            .entry(record.partition.clone())
            .or_default()
            .push(record);
    }
}

#[async_trait]
impl ConsensusStore for MemoryStore {
    async fn upsert_current(
        &self,
        observation: &ConsensusObservation,
    ) -> Result<UpsertOutcome, ValuationError> {
        let mut records = self
            .partitions
            .entry(observation.partition.clone())
            .or_default();
        let matches: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.observed_at == observation.observed_at)
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => {
                records.push(ConsensusRecord {
                    partition: observation.partition.clone(),
                    observed_at: observation.observed_at,
                    target: observation.target,
                    reference: observation.reference,
                    derived: DerivedFields::default(),
                });
                records.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
                Ok(UpsertOutcome::Inserted)
            }
            1 => {
                let record = &mut records[matches[0]];
                record.target = observation.target;
                record.reference = observation.reference;
                Ok(UpsertOutcome::Updated)
            }
            _ => Ok(UpsertOutcome::Skipped),
        }
    }

    async fn load_partition(
        &self,
        partition: &PartitionKey,
    ) -> Result<Vec<ConsensusRecord>, ValuationError> {
        let mut records = self
            .partitions
            .get(partition)
            .map(|r| r.clone())
            .unwrap_or_default();
        records.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        Ok(records)
    }

    async fn write_derived(
        &self,
        partition: &PartitionKey,
        observed_at: DateTime<Utc>,
        derived: &DerivedFields,
    ) -> Result<bool, ValuationError> {
        let mut records = match self.partitions.get_mut(partition) {
            Some(records) => records,
            None => return Ok(false),
        };
        let matches: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.observed_at == observed_at)
            .map(|(i, _)| i)
            .collect();
        if matches.len() != 1 {
            return Ok(false);
        }
        records[matches[0]].derived = derived.clone();
        Ok(true)
    }

    async fn all_partitions(&self) -> Result<Vec<PartitionKey>, ValuationError> {
        Ok(self.partitions.iter().map(|e| e.key().clone()).collect())
    }

    async fn partitions_for_subjects(
        &self,
        subjects: &[String],
    ) -> Result<Vec<PartitionKey>, ValuationError> {
        Ok(self
            .partitions
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| subjects.contains(&k.subject))
            .collect())
    }

    async fn partitions_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PartitionKey>, ValuationError> {
        Ok(self
            .partitions
            .iter()
            .filter(|e| {
                e.value()
                    .iter()
                    .any(|r| r.observed_at >= from && r.observed_at <= to)
            })
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(day: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(day * 86_400, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_outcomes_and_ordering() {
        let store = MemoryStore::new();
        let partition = PartitionKey::new("ACME", "Brightwater", "M. Reyes");

        let insert = store
            .upsert_current(&ConsensusObservation {
                partition: partition.clone(),
                observed_at: ts(2),
                target: Some(50.0),
                reference: None,
            })
            .await
            .unwrap();
        assert_eq!(insert, UpsertOutcome::Inserted);

        store
            .upsert_current(&ConsensusObservation {
                partition: partition.clone(),
                observed_at: ts(5),
                target: Some(60.0),
                reference: None,
            })
            .await
            .unwrap();

        let update = store
            .upsert_current(&ConsensusObservation {
                partition: partition.clone(),
                observed_at: ts(2),
                target: Some(55.0),
                reference: Some(48.0),
            })
            .await
            .unwrap();
        assert_eq!(update, UpsertOutcome::Updated);

        let records = store.load_partition(&partition).await.unwrap();
        assert_eq!(records.len(), 2);
        // newest first
        assert_eq!(records[0].observed_at, ts(5));
        assert_eq!(records[1].target, Some(55.0));
        assert_eq!(records[1].reference, Some(48.0));
    }

    #[tokio::test]
    async fn test_write_derived_requires_exactly_one_match() {
        let store = MemoryStore::new();
        let partition = PartitionKey::new("ACME", "Brightwater", "M. Reyes");
        let derived = DerivedFields {
            previous_target: Some(1.0),
            ..DerivedFields::default()
        };

        // no record yet
        assert!(!store
            .write_derived(&partition, ts(1), &derived)
            .await
            .unwrap());

        store.seed(ConsensusRecord {
            partition: partition.clone(),
            observed_at: ts(1),
            target: Some(10.0),
            reference: None,
            derived: DerivedFields::default(),
        });
        assert!(store
            .write_derived(&partition, ts(1), &derived)
            .await
            .unwrap());

        // duplicate identity makes the write ambiguous
        store.seed(ConsensusRecord {
            partition: partition.clone(),
            observed_at: ts(1),
            target: Some(11.0),
            reference: None,
            derived: DerivedFields::default(),
        });
        assert!(!store
            .write_derived(&partition, ts(1), &derived)
            .await
            .unwrap());
    }
}
