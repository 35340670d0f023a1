use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// How far a task got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub current: u64,
    pub total: u64,
    pub percent: f64,
    #[serde(default)]
    pub description: String,
}

impl ProgressData {
    pub fn new(current: u64, total: u64, description: impl Into<String>) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64 * 100.0).min(100.0)
        };
        Self {
            current,
            total,
            percent,
            description: description.into(),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.current)
    }
}

/// Immutable, checksummed snapshot of a task's progress and resumable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub task_name: String,
    pub checkpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub progress_data: ProgressData,
    /// Handed back to the handler on resume
    pub state_data: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub checksum: String,
}

#[derive(Serialize)]
struct ChecksumInput<'a> {
    task_id: &'a str,
    task_name: &'a str,
    checkpoint_id: &'a str,
    timestamp: &'a DateTime<Utc>,
    progress_data: &'a ProgressData,
    state_data: &'a Value,
    metadata: &'a BTreeMap<String, Value>,
}

impl Checkpoint {
    pub(crate) fn new(
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        checkpoint_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        progress_data: ProgressData,
        state_data: Value,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        let mut checkpoint = Self {
            task_id: task_id.into(),
            task_name: task_name.into(),
            checkpoint_id: checkpoint_id.into(),
            timestamp,
            progress_data,
            state_data,
            metadata,
            checksum: String::new(),
        };
        checkpoint.checksum = checkpoint.compute_checksum();
        checkpoint
    }

    /// SHA-256 hex digest over every field except the checksum itself.
    pub fn compute_checksum(&self) -> String {
        let input = ChecksumInput {
            task_id: &self.task_id,
            task_name: &self.task_name,
            checkpoint_id: &self.checkpoint_id,
            timestamp: &self.timestamp,
            progress_data: &self.progress_data,
            state_data: &self.state_data,
            metadata: &self.metadata,
        };
        // Serializing plain data into a Vec cannot fail
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn percent(&self) -> f64 {
        self.progress_data.percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            "t-1",
            "crawl_site",
            "cp-1",
            Utc::now(),
            ProgressData::new(40, 100, "pages"),
            json!({"cursor": 40}),
            BTreeMap::new(),
        )
    }

    #[test]
    fn percent_is_derived_and_clamped() {
        assert_eq!(ProgressData::new(1, 4, "").percent, 25.0);
        assert_eq!(ProgressData::new(5, 4, "").percent, 100.0);
        assert_eq!(ProgressData::new(3, 0, "").percent, 0.0);
    }

    #[test]
    fn checksum_detects_state_changes() {
        let mut cp = checkpoint();
        assert!(cp.verify());
        assert_eq!(cp.checksum.len(), 64);

        cp.state_data = json!({"cursor": 41});
        assert!(!cp.verify());
    }

    #[test]
    fn checksum_survives_serialization() {
        let cp = checkpoint();
        let restored: Checkpoint = serde_json::from_slice(&serde_json::to_vec(&cp).unwrap()).unwrap();
        assert!(restored.verify());
        assert_eq!(restored, cp);
    }
}
