//! Consensus Tracker
//!
//! Two-phase change tracking for analyst target series. Phase 1 upserts
//! current values per (subject, firm, analyst, timestamp); Phase 2 loads
//! each partition newest-first and derives previous/direction/delta
//! fields, exactly once per partition per invocation.

use appraisal_core::ValuationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod memory;
pub mod scope;
pub mod tracker;

pub use memory::MemoryStore;
pub use scope::RevisionScope;
pub use tracker::{ChangeTracker, DeriveSummary};

/// Identity of one analyst target series: subject plus publisher tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub subject: String,
    pub firm: String,
    pub analyst: String,
}

impl PartitionKey {
    pub fn new(
        subject: impl Into<String>,
        firm: impl Into<String>,
        analyst: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            firm: firm.into(),
            analyst: analyst.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subject, self.firm, self.analyst)
    }
}

/// Direction of a target revision relative to the previous record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// Phase 1 input: the current values observed for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusObservation {
    pub partition: PartitionKey,
    pub observed_at: DateTime<Utc>,
    pub target: Option<f64>,
    pub reference: Option<f64>,
}

/// Phase 2 output for one record. Written as a unit, never piecemeal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub previous_target: Option<f64>,
    pub previous_reference: Option<f64>,
    pub direction: Option<Direction>,
    pub delta: Option<f64>,
    pub delta_pct: Option<f64>,
}

/// One stored record of a partition's series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub partition: PartitionKey,
    pub observed_at: DateTime<Utc>,
    pub target: Option<f64>,
    pub reference: Option<f64>,
    #[serde(flatten)]
    pub derived: DerivedFields,
}

/// What Phase 1 did with one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The identity matched more than one existing record; nothing was
    /// written.
    Skipped,
}

/// Persistence boundary for consensus records. Phase 1 and Phase 2 touch
/// disjoint column sets; implementations must keep them that way.
#[async_trait]
pub trait ConsensusStore: Send + Sync {
    /// Insert or update current-value fields for (partition, observed_at),
    /// leaving derived fields untouched. An identity matching more than
    /// one existing record is ambiguous: write nothing, return `Skipped`.
    async fn upsert_current(
        &self,
        observation: &ConsensusObservation,
    ) -> Result<UpsertOutcome, ValuationError>;

    /// All records of one partition, newest first.
    async fn load_partition(
        &self,
        partition: &PartitionKey,
    ) -> Result<Vec<ConsensusRecord>, ValuationError>;

    /// Write only the derived fields for (partition, observed_at). Returns
    /// false when the record is missing or its identity is ambiguous.
    async fn write_derived(
        &self,
        partition: &PartitionKey,
        observed_at: DateTime<Utc>,
        derived: &DerivedFields,
    ) -> Result<bool, ValuationError>;

    async fn all_partitions(&self) -> Result<Vec<PartitionKey>, ValuationError>;

    async fn partitions_for_subjects(
        &self,
        subjects: &[String],
    ) -> Result<Vec<PartitionKey>, ValuationError>;

    /// Partitions that have at least one record inside the range.
    async fn partitions_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PartitionKey>, ValuationError>;
}
