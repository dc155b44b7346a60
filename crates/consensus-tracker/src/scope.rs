//! Operator-facing selection of which partitions Phase 2 covers.

use crate::PartitionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which partitions a derive pass should cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RevisionScope {
    /// Partitions touched by Phase 1 since the last derive pass.
    AffectedOnly,
    /// Every partition in the store.
    All,
    /// Partitions belonging to the given subjects.
    BySubject { subjects: Vec<String> },
    /// Partitions with at least one record inside the range.
    ByDateRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// An explicit partition list.
    ByPartitions { partitions: Vec<PartitionKey> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trips_through_json() {
        let scope = RevisionScope::BySubject {
            subjects: vec!["ACME".to_string()],
        };
        let json = serde_json::to_string(&scope).unwrap();
        assert!(json.contains(r#""mode":"bySubject""#));
        let back: RevisionScope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);
    }

    #[test]
    fn test_affected_only_is_a_bare_tag() {
        let scope: RevisionScope = serde_json::from_str(r#"{"mode":"affectedOnly"}"#).unwrap();
        assert_eq!(scope, RevisionScope::AffectedOnly);
    }
}
