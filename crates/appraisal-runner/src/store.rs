//! SQLite persistence for consensus records and event valuations.
//!
//! Phase 1 and Phase 2 of the change tracker write disjoint column sets
//! here; the row identity is (subject, firm, analyst, observed_at) and the
//! table's primary key enforces it, so the ambiguous-identity branch of
//! the store contract can only trigger against databases created outside
//! this schema.

use appraisal_core::{Position, UpdateMode, ValuationError, ValuationResult};
use appraisal_orchestrator::merge_values;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use consensus_tracker::{
    ConsensusObservation, ConsensusRecord, ConsensusStore, DerivedFields, Direction, PartitionKey,
    UpsertOutcome,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS consensus_records (
    subject TEXT NOT NULL,
    firm TEXT NOT NULL,
    analyst TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    target REAL,
    reference REAL,
    previous_target REAL,
    previous_reference REAL,
    direction TEXT,
    delta REAL,
    delta_pct REAL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (subject, firm, analyst, observed_at)
);

CREATE INDEX IF NOT EXISTS idx_consensus_subject ON consensus_records(subject);
CREATE INDEX IF NOT EXISTS idx_consensus_observed ON consensus_records(observed_at);

CREATE TABLE IF NOT EXISTS event_valuations (
    event_id TEXT PRIMARY KEY,
    subject TEXT NOT NULL,
    computed_at TEXT NOT NULL,
    value_quantitative TEXT NOT NULL,
    value_qualitative TEXT NOT NULL,
    position_quantitative TEXT NOT NULL,
    position_qualitative TEXT NOT NULL,
    disparity_quantitative REAL,
    disparity_qualitative REAL
);

CREATE INDEX IF NOT EXISTS idx_valuations_subject ON event_valuations(subject)
"#;

fn storage(e: impl std::fmt::Display) -> ValuationError {
    ValuationError::Storage(e.to_string())
}

fn position_str(position: Position) -> &'static str {
    match position {
        Position::Long => "long",
        Position::Short => "short",
        Position::Undefined => "undefined",
    }
}

fn parse_position(raw: &str) -> Position {
    match raw {
        "long" => Position::Long,
        "short" => Position::Short,
        _ => Position::Undefined,
    }
}

#[derive(Debug, FromRow)]
struct ConsensusRow {
    subject: String,
    firm: String,
    analyst: String,
    observed_at: DateTime<Utc>,
    target: Option<f64>,
    reference: Option<f64>,
    previous_target: Option<f64>,
    previous_reference: Option<f64>,
    direction: Option<String>,
    delta: Option<f64>,
    delta_pct: Option<f64>,
}

impl ConsensusRow {
    fn into_record(self) -> ConsensusRecord {
        let direction = match self.direction.as_deref() {
            Some("up") => Some(Direction::Up),
            Some("down") => Some(Direction::Down),
            _ => None,
        };
        ConsensusRecord {
            partition: PartitionKey::new(self.subject, self.firm, self.analyst),
            observed_at: self.observed_at,
            target: self.target,
            reference: self.reference,
            derived: DerivedFields {
                previous_target: self.previous_target,
                previous_reference: self.previous_reference,
                direction,
                delta: self.delta,
                delta_pct: self.delta_pct,
            },
        }
    }
}

#[derive(Debug, FromRow)]
struct PartitionRow {
    subject: String,
    firm: String,
    analyst: String,
}

#[derive(Debug, FromRow)]
struct ValuationRow {
    event_id: String,
    subject: String,
    computed_at: DateTime<Utc>,
    value_quantitative: String,
    value_qualitative: String,
    position_quantitative: String,
    position_qualitative: String,
    disparity_quantitative: Option<f64>,
    disparity_qualitative: Option<f64>,
}

impl ValuationRow {
    fn into_result(self) -> Result<ValuationResult, ValuationError> {
        let value_quantitative = serde_json::from_str(&self.value_quantitative).map_err(storage)?;
        let value_qualitative = serde_json::from_str(&self.value_qualitative).map_err(storage)?;
        Ok(ValuationResult {
            event_id: self.event_id,
            subject: self.subject,
            computed_at: self.computed_at,
            value_quantitative,
            value_qualitative,
            position_quantitative: parse_position(&self.position_quantitative),
            position_qualitative: parse_position(&self.position_qualitative),
            disparity_quantitative: self.disparity_quantitative,
            disparity_qualitative: self.disparity_qualitative,
        })
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and ensure the schema.
    pub async fn connect(db_path: &str) -> Result<Self, ValuationError> {
        Self::open(&format!("sqlite:{}", db_path)).await
    }

    /// A throwaway store that vanishes when dropped.
    pub async fn in_memory() -> Result<Self, ValuationError> {
        Self::open("sqlite::memory:").await
    }

    async fn open(database_url: &str) -> Result<Self, ValuationError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(storage)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(storage)?;

        // WAL lets tracker tasks write while valuations are read back
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .map_err(storage)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ValuationError> {
        // sqlx executes one statement at a time
        for statement in SCHEMA.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
            }
        }
        Ok(())
    }

    /// Write one valuation, merging into any stored copy per the mode.
    pub async fn save_valuation(
        &self,
        result: &ValuationResult,
        mode: UpdateMode,
    ) -> Result<(), ValuationError> {
        let (quantitative, qualitative) = match mode {
            UpdateMode::Replace => (
                result.value_quantitative.clone(),
                result.value_qualitative.clone(),
            ),
            UpdateMode::FillNull => match self.load_valuation(&result.event_id).await? {
                Some(existing) => (
                    merge_values(&existing.value_quantitative, &result.value_quantitative, mode),
                    merge_values(&existing.value_qualitative, &result.value_qualitative, mode),
                ),
                None => (
                    result.value_quantitative.clone(),
                    result.value_qualitative.clone(),
                ),
            },
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO event_valuations (
                event_id, subject, computed_at,
                value_quantitative, value_qualitative,
                position_quantitative, position_qualitative,
                disparity_quantitative, disparity_qualitative
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.event_id)
        .bind(&result.subject)
        .bind(result.computed_at)
        .bind(serde_json::to_string(&quantitative).map_err(storage)?)
        .bind(serde_json::to_string(&qualitative).map_err(storage)?)
        .bind(position_str(result.position_quantitative))
        .bind(position_str(result.position_qualitative))
        .bind(result.disparity_quantitative)
        .bind(result.disparity_qualitative)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    /// Read back one stored valuation.
    pub async fn load_valuation(
        &self,
        event_id: &str,
    ) -> Result<Option<ValuationResult>, ValuationError> {
        let row: Option<ValuationRow> = sqlx::query_as(
            r#"
            SELECT event_id, subject, computed_at,
                   value_quantitative, value_qualitative,
                   position_quantitative, position_qualitative,
                   disparity_quantitative, disparity_qualitative
            FROM event_valuations
            WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(ValuationRow::into_result).transpose()
    }
}

#[async_trait]
impl ConsensusStore for SqliteStore {
    async fn upsert_current(
        &self,
        observation: &ConsensusObservation,
    ) -> Result<UpsertOutcome, ValuationError> {
        let partition = &observation.partition;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM consensus_records \
             WHERE subject = ? AND firm = ? AND analyst = ? AND observed_at = ?",
        )
        .bind(&partition.subject)
        .bind(&partition.firm)
        .bind(&partition.analyst)
        .bind(observation.observed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        match count {
            0 => {
                sqlx::query(
                    "INSERT INTO consensus_records (subject, firm, analyst, observed_at, target, reference) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&partition.subject)
                .bind(&partition.firm)
                .bind(&partition.analyst)
                .bind(observation.observed_at)
                .bind(observation.target)
                .bind(observation.reference)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
                Ok(UpsertOutcome::Inserted)
            }
            1 => {
                sqlx::query(
                    "UPDATE consensus_records SET target = ?, reference = ? \
                     WHERE subject = ? AND firm = ? AND analyst = ? AND observed_at = ?",
                )
                .bind(observation.target)
                .bind(observation.reference)
                .bind(&partition.subject)
                .bind(&partition.firm)
                .bind(&partition.analyst)
                .bind(observation.observed_at)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
                Ok(UpsertOutcome::Updated)
            }
            _ => Ok(UpsertOutcome::Skipped),
        }
    }

    async fn load_partition(
        &self,
        partition: &PartitionKey,
    ) -> Result<Vec<ConsensusRecord>, ValuationError> {
        let rows: Vec<ConsensusRow> = sqlx::query_as(
            r#"
            SELECT subject, firm, analyst, observed_at, target, reference,
                   previous_target, previous_reference, direction, delta, delta_pct
            FROM consensus_records
            WHERE subject = ? AND firm = ? AND analyst = ?
            ORDER BY observed_at DESC
            "#,
        )
        .bind(&partition.subject)
        .bind(&partition.firm)
        .bind(&partition.analyst)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows.into_iter().map(ConsensusRow::into_record).collect())
    }

    async fn write_derived(
        &self,
        partition: &PartitionKey,
        observed_at: DateTime<Utc>,
        derived: &DerivedFields,
    ) -> Result<bool, ValuationError> {
        let direction = derived.direction.map(|d| match d {
            Direction::Up => "up",
            Direction::Down => "down",
        });
        let result = sqlx::query(
            "UPDATE consensus_records \
             SET previous_target = ?, previous_reference = ?, direction = ?, delta = ?, delta_pct = ? \
             WHERE subject = ? AND firm = ? AND analyst = ? AND observed_at = ?",
        )
        .bind(derived.previous_target)
        .bind(derived.previous_reference)
        .bind(direction)
        .bind(derived.delta)
        .bind(derived.delta_pct)
        .bind(&partition.subject)
        .bind(&partition.firm)
        .bind(&partition.analyst)
        .bind(observed_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn all_partitions(&self) -> Result<Vec<PartitionKey>, ValuationError> {
        let rows: Vec<PartitionRow> = sqlx::query_as(
            "SELECT DISTINCT subject, firm, analyst FROM consensus_records \
             ORDER BY subject, firm, analyst",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .into_iter()
            .map(|r| PartitionKey::new(r.subject, r.firm, r.analyst))
            .collect())
    }

    async fn partitions_for_subjects(
        &self,
        subjects: &[String],
    ) -> Result<Vec<PartitionKey>, ValuationError> {
        let mut partitions = Vec::new();
        for subject in subjects {
            let rows: Vec<PartitionRow> = sqlx::query_as(
                "SELECT DISTINCT subject, firm, analyst FROM consensus_records \
                 WHERE subject = ? ORDER BY firm, analyst",
            )
            .bind(subject)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
            partitions.extend(
                rows.into_iter()
                    .map(|r| PartitionKey::new(r.subject, r.firm, r.analyst)),
            );
        }
        Ok(partitions)
    }

    async fn partitions_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PartitionKey>, ValuationError> {
        let rows: Vec<PartitionRow> = sqlx::query_as(
            "SELECT DISTINCT subject, firm, analyst FROM consensus_records \
             WHERE observed_at >= ? AND observed_at <= ? \
             ORDER BY subject, firm, analyst",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .into_iter()
            .map(|r| PartitionKey::new(r.subject, r.firm, r.analyst))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appraisal_core::{DomainGroup, DomainValues};
    use chrono::{Duration, TimeZone};
    use consensus_tracker::{ChangeTracker, RevisionScope};
    use std::sync::Arc;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn obs(subject: &str, minutes: i64, target: f64, reference: f64) -> ConsensusObservation {
        ConsensusObservation {
            partition: PartitionKey::new(subject, "Keystone", "Vale"),
            observed_at: at(minutes),
            target: Some(target),
            reference: Some(reference),
        }
    }

    fn tree(group: &str, metric: &str, value: Option<f64>) -> DomainValues {
        let mut domain = DomainGroup::default();
        domain.values.insert(metric.to_string(), value);
        let mut out = DomainValues::new();
        out.insert(group.to_string(), domain);
        out
    }

    fn result_with(event_id: &str, quantitative: DomainValues) -> ValuationResult {
        ValuationResult {
            event_id: event_id.to_string(),
            subject: "AAPL".to_string(),
            computed_at: at(0),
            value_quantitative: quantitative,
            value_qualitative: DomainValues::new(),
            position_quantitative: Position::Long,
            position_qualitative: Position::Undefined,
            disparity_quantitative: Some(0.2),
            disparity_qualitative: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates_and_orders_newest_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        let partition = PartitionKey::new("AAPL", "Keystone", "Vale");

        assert_eq!(
            store.upsert_current(&obs("AAPL", 0, 100.0, 90.0)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_current(&obs("AAPL", 60, 110.0, 95.0)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_current(&obs("AAPL", 0, 105.0, 91.0)).await.unwrap(),
            UpsertOutcome::Updated
        );

        let records = store.load_partition(&partition).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].observed_at, at(60));
        assert_eq!(records[1].target, Some(105.0));
        assert_eq!(records[1].derived, DerivedFields::default());
    }

    #[tokio::test]
    async fn test_write_derived_targets_exactly_one_row() {
        let store = SqliteStore::in_memory().await.unwrap();
        let partition = PartitionKey::new("AAPL", "Keystone", "Vale");
        store.upsert_current(&obs("AAPL", 0, 100.0, 90.0)).await.unwrap();
        store.upsert_current(&obs("AAPL", 60, 110.0, 95.0)).await.unwrap();

        let derived = DerivedFields {
            previous_target: Some(100.0),
            previous_reference: Some(90.0),
            direction: Some(Direction::Up),
            delta: Some(10.0),
            delta_pct: Some(0.1),
        };
        assert!(store.write_derived(&partition, at(60), &derived).await.unwrap());
        assert!(!store.write_derived(&partition, at(999), &derived).await.unwrap());

        let records = store.load_partition(&partition).await.unwrap();
        assert_eq!(records[0].derived, derived);
        assert_eq!(records[1].derived, DerivedFields::default());
    }

    #[tokio::test]
    async fn test_partition_queries_filter_by_subject_and_range() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_current(&obs("AAPL", 0, 100.0, 90.0)).await.unwrap();
        store
            .upsert_current(&ConsensusObservation {
                partition: PartitionKey::new("AAPL", "Meridian", "Cho"),
                observed_at: at(30),
                target: Some(120.0),
                reference: Some(91.0),
            })
            .await
            .unwrap();
        store.upsert_current(&obs("MSFT", 600, 400.0, 380.0)).await.unwrap();

        assert_eq!(store.all_partitions().await.unwrap().len(), 3);

        let aapl = store
            .partitions_for_subjects(&["AAPL".to_string()])
            .await
            .unwrap();
        assert_eq!(aapl.len(), 2);
        assert!(aapl.iter().all(|p| p.subject == "AAPL"));

        let late = store.partitions_in_range(at(300), at(900)).await.unwrap();
        assert_eq!(late, vec![PartitionKey::new("MSFT", "Keystone", "Vale")]);
    }

    #[tokio::test]
    async fn test_tracker_derives_against_sqlite() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let tracker = ChangeTracker::new(Arc::clone(&store));

        tracker.record_observation(&obs("AAPL", 0, 100.0, 90.0)).await.unwrap();
        tracker.record_observation(&obs("AAPL", 60, 110.0, 95.0)).await.unwrap();
        let summary = tracker.derive(RevisionScope::AffectedOnly).await.unwrap();
        assert_eq!(summary.partitions_processed, 1);
        assert_eq!(summary.records_updated, 1);

        let partition = PartitionKey::new("AAPL", "Keystone", "Vale");
        let records = store.load_partition(&partition).await.unwrap();
        assert_eq!(records[0].derived.previous_target, Some(100.0));
        assert_eq!(records[0].derived.direction, Some(Direction::Up));
        assert_eq!(records[0].derived.delta, Some(10.0));
        assert_eq!(records[1].derived, DerivedFields::default());
    }

    #[tokio::test]
    async fn test_save_valuation_replace_overwrites_fill_null_merges() {
        let store = SqliteStore::in_memory().await.unwrap();

        let mut first_tree = tree("valuation", "fair_value", Some(120.0));
        first_tree
            .get_mut("valuation")
            .unwrap()
            .values
            .insert("pe_ratio".to_string(), None);
        store
            .save_valuation(&result_with("ev-1", first_tree), UpdateMode::Replace)
            .await
            .unwrap();

        // fresh run filled pe_ratio but lost fair_value; FillNull keeps both
        let mut second_tree = tree("valuation", "fair_value", None);
        second_tree
            .get_mut("valuation")
            .unwrap()
            .values
            .insert("pe_ratio".to_string(), Some(30.0));
        store
            .save_valuation(&result_with("ev-1", second_tree.clone()), UpdateMode::FillNull)
            .await
            .unwrap();

        let merged = store.load_valuation("ev-1").await.unwrap().unwrap();
        let group = &merged.value_quantitative["valuation"];
        assert_eq!(group.values["fair_value"], Some(120.0));
        assert_eq!(group.values["pe_ratio"], Some(30.0));

        store
            .save_valuation(&result_with("ev-1", second_tree), UpdateMode::Replace)
            .await
            .unwrap();
        let replaced = store.load_valuation("ev-1").await.unwrap().unwrap();
        assert_eq!(replaced.value_quantitative["valuation"].values["fair_value"], None);

        assert!(store.load_valuation("missing").await.unwrap().is_none());
    }
}
