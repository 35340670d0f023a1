//! File-backed checkpoint store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/index.json                       task_id -> [checkpoint_id, ...] (oldest first)
//! <root>/checkpoints/<checkpoint_id>.json one compact JSON document per checkpoint
//! ```
//!
//! Every document is written to a temp file and renamed into place, so a
//! crash mid-write never damages an existing checkpoint. Reads verify both
//! the checksum and that the stored bytes are the canonical encoding; any
//! mismatch is logged and the checkpoint is treated as absent.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Checkpoint, ProgressData};
use crate::audit::{AuditRecord, AuditSink};
use crate::error::{OrchestratorError, Result};

const INDEX_FILE: &str = "index.json";
const CHECKPOINT_DIR: &str = "checkpoints";

/// Bulk transfer format used by `export` and `import`.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointExport {
    task_id: String,
    exported_at: DateTime<Utc>,
    /// Newest first, as returned by `list`
    checkpoints: Vec<Checkpoint>,
}

#[derive(Default)]
struct Index {
    /// Per task, ordered oldest first by timestamp
    tasks: BTreeMap<String, Vec<String>>,
    timestamps: HashMap<String, DateTime<Utc>>,
}

impl Index {
    fn owner(&self, checkpoint_id: &str) -> Option<String> {
        self.tasks
            .iter()
            .find(|(_, ids)| ids.iter().any(|id| id == checkpoint_id))
            .map(|(task_id, _)| task_id.clone())
    }

    fn timestamp(&self, checkpoint_id: &str) -> DateTime<Utc> {
        self.timestamps
            .get(checkpoint_id)
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Insert keeping timestamp order; ties go after existing entries.
    fn insert(&mut self, task_id: &str, checkpoint_id: &str, timestamp: DateTime<Utc>) {
        self.timestamps.insert(checkpoint_id.to_string(), timestamp);
        let position = {
            let ids = self.tasks.get(task_id).map(Vec::as_slice).unwrap_or(&[]);
            ids.iter()
                .rposition(|id| self.timestamp(id) <= timestamp)
                .map_or(0, |i| i + 1)
        };
        self.tasks
            .entry(task_id.to_string())
            .or_default()
            .insert(position, checkpoint_id.to_string());
    }

    fn remove(&mut self, task_id: &str, checkpoint_id: &str) -> bool {
        let Some(ids) = self.tasks.get_mut(task_id) else {
            return false;
        };
        let before = ids.len();
        ids.retain(|id| id != checkpoint_id);
        let removed = ids.len() != before;
        if ids.is_empty() {
            self.tasks.remove(task_id);
        }
        self.timestamps.remove(checkpoint_id);
        removed
    }
}

pub struct CheckpointStore {
    root: PathBuf,
    max_checkpoints: usize,
    audit: Arc<dyn AuditSink>,
    index: Mutex<Index>,
}

impl CheckpointStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// A missing or unreadable index is rebuilt from the checkpoint files.
    pub async fn open(
        root: impl Into<PathBuf>,
        max_checkpoints: usize,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        if max_checkpoints == 0 {
            return Err(OrchestratorError::InvalidArgument(
                "max_checkpoints must be positive".into(),
            ));
        }

        let root = root.into();
        tokio::fs::create_dir_all(root.join(CHECKPOINT_DIR)).await?;

        let store = Self {
            root,
            max_checkpoints,
            audit,
            index: Mutex::new(Index::default()),
        };

        let index = match store.read_index().await {
            Some(tasks) => store.index_from(tasks).await,
            None => store.rebuild_index().await?,
        };
        let task_count = index.tasks.len();
        *store.index.lock().await = index;

        info!(
            root = %store.root.display(),
            tasks = task_count,
            max_checkpoints,
            "Checkpoint store opened"
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_checkpoints(&self) -> usize {
        self.max_checkpoints
    }

    fn checkpoint_path(&self, checkpoint_id: &str) -> PathBuf {
        self.root
            .join(CHECKPOINT_DIR)
            .join(format!("{checkpoint_id}.json"))
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Snapshot a task's progress. Evicts the oldest checkpoints past the retention limit.
    pub async fn create(
        &self,
        task_id: &str,
        task_name: &str,
        progress_data: ProgressData,
        state_data: Value,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<String> {
        let checkpoint = Checkpoint::new(
            task_id,
            task_name,
            Uuid::now_v7().to_string(),
            Utc::now(),
            progress_data,
            state_data,
            metadata.unwrap_or_default(),
        );
        let checkpoint_id = checkpoint.checkpoint_id.clone();

        let mut records = vec![AuditRecord::CheckpointCreated {
            task_id: checkpoint.task_id.clone(),
            task_name: checkpoint.task_name.clone(),
            checkpoint_id: checkpoint_id.clone(),
            checksum: checkpoint.checksum.clone(),
            percent: checkpoint.percent(),
            timestamp: checkpoint.timestamp,
        }];

        {
            let mut index = self.index.lock().await;
            self.write_checkpoint(&checkpoint).await?;
            index.insert(task_id, &checkpoint_id, checkpoint.timestamp);
            records.extend(self.evict(&mut index, task_id).await);
            self.write_index(&index).await?;
        }

        debug!(
            task_id = %task_id,
            checkpoint_id = %checkpoint_id,
            percent = checkpoint.percent(),
            "Checkpoint created"
        );
        self.mirror(records).await;
        Ok(checkpoint_id)
    }

    /// Remove one checkpoint. Returns false when it does not exist.
    pub async fn remove(&self, checkpoint_id: &str) -> Result<bool> {
        if !is_valid_id(checkpoint_id) {
            return Ok(false);
        }

        let task_id = {
            let mut index = self.index.lock().await;
            let Some(task_id) = index.owner(checkpoint_id) else {
                return Ok(false);
            };
            index.remove(&task_id, checkpoint_id);
            self.delete_file(checkpoint_id).await;
            self.write_index(&index).await?;
            task_id
        };

        self.mirror(vec![removed(&task_id, checkpoint_id, "removed")])
            .await;
        Ok(true)
    }

    /// Remove every checkpoint of a task.
    pub async fn clear(&self, task_id: &str) -> Result<usize> {
        let ids = {
            let mut index = self.index.lock().await;
            let Some(ids) = index.tasks.remove(task_id) else {
                return Ok(0);
            };
            for id in &ids {
                index.timestamps.remove(id);
                self.delete_file(id).await;
            }
            self.write_index(&index).await?;
            ids
        };

        info!(task_id = %task_id, count = ids.len(), "Checkpoints cleared");
        let count = ids.len();
        self.mirror(
            ids.iter()
                .map(|id| removed(task_id, id, "cleared"))
                .collect(),
        )
        .await;
        Ok(count)
    }

    /// Remove checkpoints older than `days` across all tasks.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));

        let expired: Vec<(String, String)> = {
            let mut index = self.index.lock().await;
            let expired: Vec<(String, String)> = index
                .tasks
                .iter()
                .flat_map(|(task_id, ids)| {
                    ids.iter()
                        .filter(|id| index.timestamp(id) < cutoff)
                        .map(|id| (task_id.clone(), id.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();

            if expired.is_empty() {
                return Ok(0);
            }
            for (task_id, id) in &expired {
                index.remove(task_id, id);
                self.delete_file(id).await;
            }
            self.write_index(&index).await?;
            expired
        };

        info!(count = expired.len(), days, "Expired checkpoints removed");
        let count = expired.len();
        self.mirror(
            expired
                .iter()
                .map(|(task_id, id)| removed(task_id, id, "expired"))
                .collect(),
        )
        .await;
        Ok(count)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Load and verify one checkpoint. Missing or corrupted checkpoints are `None`.
    pub async fn load(&self, checkpoint_id: &str) -> Option<Checkpoint> {
        if !is_valid_id(checkpoint_id) {
            warn!(checkpoint_id = %checkpoint_id, "Rejected malformed checkpoint id");
            return None;
        }
        self.read_checkpoint(checkpoint_id).await
    }

    /// Newest valid checkpoint of a task.
    pub async fn latest(&self, task_id: &str) -> Option<Checkpoint> {
        for checkpoint_id in self.ids_newest_first(task_id).await {
            if let Some(checkpoint) = self.read_checkpoint(&checkpoint_id).await {
                return Some(checkpoint);
            }
        }
        None
    }

    /// Valid checkpoints of a task, newest first.
    pub async fn list(&self, task_id: &str) -> Vec<Checkpoint> {
        let mut checkpoints = Vec::new();
        for checkpoint_id in self.ids_newest_first(task_id).await {
            if let Some(checkpoint) = self.read_checkpoint(&checkpoint_id).await {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints
    }

    pub async fn has_checkpoints(&self, task_id: &str) -> bool {
        self.index.lock().await.tasks.contains_key(task_id)
    }

    pub async fn tasks_with_checkpoints(&self) -> Vec<String> {
        self.index.lock().await.tasks.keys().cloned().collect()
    }

    async fn ids_newest_first(&self, task_id: &str) -> Vec<String> {
        let index = self.index.lock().await;
        index
            .tasks
            .get(task_id)
            .map(|ids| ids.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Bulk transfer
    // ------------------------------------------------------------------------

    /// Write every valid checkpoint of a task to `path`. Returns the count.
    pub async fn export(&self, task_id: &str, path: impl AsRef<Path>) -> Result<usize> {
        let checkpoints = self.list(task_id).await;
        let count = checkpoints.len();
        let document = CheckpointExport {
            task_id: task_id.to_string(),
            exported_at: Utc::now(),
            checkpoints,
        };
        write_atomic(path.as_ref(), &serde_json::to_vec_pretty(&document)?).await?;
        info!(task_id = %task_id, count, path = %path.as_ref().display(), "Checkpoints exported");
        Ok(count)
    }

    /// Import checkpoints exported by another store, keeping ids and checksums.
    ///
    /// Entries that fail verification or already exist are skipped.
    pub async fn import(&self, path: impl AsRef<Path>) -> Result<usize> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let document: CheckpointExport = serde_json::from_slice(&bytes)?;

        let mut records = Vec::new();
        let mut imported = 0;
        {
            let mut index = self.index.lock().await;
            // Oldest first so equal timestamps keep their exported order
            for checkpoint in document.checkpoints.iter().rev() {
                if !is_valid_id(&checkpoint.checkpoint_id) || !checkpoint.verify() {
                    warn!(
                        checkpoint_id = %checkpoint.checkpoint_id,
                        "Skipping imported checkpoint that failed verification"
                    );
                    continue;
                }
                if index.timestamps.contains_key(&checkpoint.checkpoint_id) {
                    debug!(checkpoint_id = %checkpoint.checkpoint_id, "Checkpoint already present");
                    continue;
                }

                self.write_checkpoint(checkpoint).await?;
                index.insert(
                    &checkpoint.task_id,
                    &checkpoint.checkpoint_id,
                    checkpoint.timestamp,
                );
                records.push(AuditRecord::CheckpointCreated {
                    task_id: checkpoint.task_id.clone(),
                    task_name: checkpoint.task_name.clone(),
                    checkpoint_id: checkpoint.checkpoint_id.clone(),
                    checksum: checkpoint.checksum.clone(),
                    percent: checkpoint.percent(),
                    timestamp: checkpoint.timestamp,
                });
                imported += 1;
            }

            let task_ids: Vec<String> = document
                .checkpoints
                .iter()
                .map(|checkpoint| checkpoint.task_id.clone())
                .collect();
            for task_id in task_ids {
                records.extend(self.evict(&mut index, &task_id).await);
            }
            self.write_index(&index).await?;
        }

        info!(
            task_id = %document.task_id,
            imported,
            path = %path.as_ref().display(),
            "Checkpoints imported"
        );
        self.mirror(records).await;
        Ok(imported)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Drop the oldest checkpoints of `task_id` past the retention limit.
    async fn evict(&self, index: &mut Index, task_id: &str) -> Vec<AuditRecord> {
        let mut records = Vec::new();
        loop {
            let oldest = match index.tasks.get(task_id) {
                Some(ids) if ids.len() > self.max_checkpoints => ids[0].clone(),
                _ => break,
            };
            index.remove(task_id, &oldest);
            self.delete_file(&oldest).await;
            debug!(task_id = %task_id, checkpoint_id = %oldest, "Checkpoint evicted");
            records.push(removed(task_id, &oldest, "evicted"));
        }
        records
    }

    async fn mirror(&self, records: Vec<AuditRecord>) {
        for record in records {
            if let Err(e) = self.audit.record(record).await {
                warn!(error = %e, "Failed to mirror checkpoint change to audit trail");
            }
        }
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        write_atomic(&self.checkpoint_path(&checkpoint.checkpoint_id), &bytes).await
    }

    async fn read_checkpoint(&self, checkpoint_id: &str) -> Option<Checkpoint> {
        let path = self.checkpoint_path(checkpoint_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(checkpoint_id = %checkpoint_id, error = %e, "Failed to read checkpoint");
                return None;
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(checkpoint_id = %checkpoint_id, error = %e, "Checkpoint is not valid JSON");
                return None;
            }
        };

        let canonical = serde_json::to_vec(&checkpoint).ok();
        if !checkpoint.verify() || canonical.as_deref() != Some(bytes.as_slice()) {
            warn!(
                checkpoint_id = %checkpoint_id,
                task_id = %checkpoint.task_id,
                "Checkpoint failed integrity check, ignoring it"
            );
            return None;
        }
        if checkpoint.checkpoint_id != checkpoint_id {
            warn!(checkpoint_id = %checkpoint_id, "Checkpoint file holds a different id");
            return None;
        }
        Some(checkpoint)
    }

    async fn delete_file(&self, checkpoint_id: &str) {
        match tokio::fs::remove_file(self.checkpoint_path(checkpoint_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(checkpoint_id = %checkpoint_id, error = %e, "Failed to delete checkpoint file"),
        }
    }

    async fn read_index(&self) -> Option<BTreeMap<String, Vec<String>>> {
        let path = self.root.join(INDEX_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read checkpoint index, rebuilding");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(tasks) => Some(tasks),
            Err(e) => {
                warn!(error = %e, "Checkpoint index is corrupted, rebuilding");
                None
            }
        }
    }

    async fn write_index(&self, index: &Index) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&index.tasks)?;
        write_atomic(&self.root.join(INDEX_FILE), &bytes).await
    }

    /// Load timestamps for an index read from disk. Unreadable entries sort first.
    async fn index_from(&self, tasks: BTreeMap<String, Vec<String>>) -> Index {
        let mut index = Index::default();
        for (task_id, ids) in tasks {
            for checkpoint_id in ids.into_iter().filter(|id| is_valid_id(id)) {
                let timestamp = self
                    .read_checkpoint(&checkpoint_id)
                    .await
                    .map_or(DateTime::<Utc>::MIN_UTC, |checkpoint| checkpoint.timestamp);
                index.insert(&task_id, &checkpoint_id, timestamp);
            }
        }
        index
    }

    /// Rebuild the index by scanning the checkpoint directory.
    async fn rebuild_index(&self) -> Result<Index> {
        let mut index = Index::default();
        let mut entries = tokio::fs::read_dir(self.root.join(CHECKPOINT_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(checkpoint_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if !is_valid_id(checkpoint_id) {
                continue;
            }
            if let Some(checkpoint) = self.read_checkpoint(checkpoint_id).await {
                index.insert(
                    &checkpoint.task_id,
                    &checkpoint.checkpoint_id,
                    checkpoint.timestamp,
                );
            }
        }

        if !index.tasks.is_empty() {
            info!(tasks = index.tasks.len(), "Rebuilt checkpoint index from files");
            self.write_index(&index).await?;
        }
        Ok(index)
    }
}

fn removed(task_id: &str, checkpoint_id: &str, reason: &str) -> AuditRecord {
    AuditRecord::CheckpointRemoved {
        task_id: task_id.to_string(),
        checkpoint_id: checkpoint_id.to_string(),
        reason: reason.to_string(),
        timestamp: Utc::now(),
    }
}

/// Ids become file names, so only allow a conservative character set.
fn is_valid_id(checkpoint_id: &str) -> bool {
    !checkpoint_id.is_empty()
        && checkpoint_id.len() <= 128
        && checkpoint_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("checkpoint");
    let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    tokio::fs::write(&temp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use serde_json::json;

    async fn store(dir: &Path, max: usize) -> (Arc<MemoryAuditSink>, CheckpointStore) {
        let audit = Arc::new(MemoryAuditSink::new());
        let store = CheckpointStore::open(dir, max, audit.clone()).await.unwrap();
        (audit, store)
    }

    #[tokio::test]
    async fn create_then_latest_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, store) = store(dir.path(), 10).await;

        let first = store
            .create("t-1", "crawl_site", ProgressData::new(10, 100, ""), json!({"page": 10}), None)
            .await
            .unwrap();
        let second = store
            .create("t-1", "crawl_site", ProgressData::new(20, 100, ""), json!({"page": 20}), None)
            .await
            .unwrap();

        assert_eq!(store.latest("t-1").await.unwrap().checkpoint_id, second);
        let ids: Vec<_> = store
            .list("t-1")
            .await
            .into_iter()
            .map(|cp| cp.checkpoint_id)
            .collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(audit.records().len(), 2);
    }

    #[tokio::test]
    async fn retention_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, store) = store(dir.path(), 2).await;

        let mut ids = Vec::new();
        for page in 0..3 {
            ids.push(
                store
                    .create("t-1", "crawl_site", ProgressData::new(page, 3, ""), json!(page), None)
                    .await
                    .unwrap(),
            );
        }

        assert!(store.load(&ids[0]).await.is_none());
        assert_eq!(store.list("t-1").await.len(), 2);
        assert!(audit.records().iter().any(|record| matches!(
            record,
            AuditRecord::CheckpointRemoved { reason, .. } if reason == "evicted"
        )));
    }

    #[tokio::test]
    async fn remove_and_clear_report_misses() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = store(dir.path(), 10).await;

        let id = store
            .create("t-1", "crawl_site", ProgressData::new(1, 2, ""), json!(null), None)
            .await
            .unwrap();
        store
            .create("t-1", "crawl_site", ProgressData::new(2, 2, ""), json!(null), None)
            .await
            .unwrap();

        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert!(!store.remove("../index").await.unwrap());
        assert_eq!(store.clear("t-1").await.unwrap(), 1);
        assert_eq!(store.clear("t-1").await.unwrap(), 0);
        assert!(store.tasks_with_checkpoints().await.is_empty());
    }

    #[tokio::test]
    async fn index_survives_reopen_and_is_rebuilt_when_lost() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let (_, store) = store(dir.path(), 10).await;
            store
                .create("t-1", "crawl_site", ProgressData::new(5, 10, ""), json!({"k": 1}), None)
                .await
                .unwrap()
        };

        let (_, reopened) = store(dir.path(), 10).await;
        assert_eq!(reopened.latest("t-1").await.unwrap().checkpoint_id, id);

        tokio::fs::remove_file(dir.path().join(INDEX_FILE)).await.unwrap();
        let (_, rebuilt) = store(dir.path(), 10).await;
        assert_eq!(rebuilt.latest("t-1").await.unwrap().checkpoint_id, id);
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (_, store) = store(dir.path(), 10).await;
        store
            .create("t-1", "crawl_site", ProgressData::new(1, 2, ""), json!(null), None)
            .await
            .unwrap();

        assert_eq!(store.cleanup_older_than(7).await.unwrap(), 0);
        assert_eq!(store.list("t-1").await.len(), 1);
    }

    #[test]
    fn ids_are_path_safe() {
        assert!(is_valid_id(&Uuid::now_v7().to_string()));
        assert!(!is_valid_id("../../etc/passwd"));
        assert!(!is_valid_id(""));
    }
}
