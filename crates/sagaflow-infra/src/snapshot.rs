//! Filesystem snapshot store.
//!
//! One pretty-printed JSON file per run: `{dir}/{run_id}.json`. The directory
//! is created on first save.

use std::path::{Path, PathBuf};

use sagaflow_core::repository::SnapshotStore;
use sagaflow_types::error::SnapshotStoreError;
use sagaflow_types::run::FlowSnapshot;
use uuid::Uuid;

/// [`SnapshotStore`] backed by a directory of JSON files.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `{data_dir}/snapshots/`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("snapshots"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

/// Read and decode one snapshot file.
pub async fn read_snapshot_file(path: &Path) -> Result<FlowSnapshot, SnapshotStoreError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SnapshotStoreError::Storage(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| SnapshotStoreError::Serialization(format!("{}: {e}", path.display())))
}

impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &FlowSnapshot) -> Result<(), SnapshotStoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SnapshotStoreError::Storage(e.to_string()))?;

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| SnapshotStoreError::Serialization(e.to_string()))?;
        let path = self.path_for(&snapshot.run.run_id);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| SnapshotStoreError::Storage(e.to_string()))?;

        tracing::debug!(
            run_id = %snapshot.run.run_id,
            path = %path.display(),
            "saved flow snapshot"
        );
        Ok(())
    }

    async fn load(&self, run_id: &Uuid) -> Result<Option<FlowSnapshot>, SnapshotStoreError> {
        let path = self.path_for(run_id);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => read_snapshot_file(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(SnapshotStoreError::Storage(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<Uuid>, SnapshotStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SnapshotStoreError::Storage(e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SnapshotStoreError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            // Foreign JSON files in the directory are ignored.
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, SnapshotStoreError> {
        match tokio::fs::remove_file(self.path_for(run_id)).await {
            Ok(()) => {
                tracing::debug!(run_id = %run_id, "deleted flow snapshot");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SnapshotStoreError::Storage(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sagaflow_types::flow::{FlowDefinition, FlowStep};
    use sagaflow_types::run::{FlowRun, FlowStatus, StepRecord};
    use serde_json::{Map, json};
    use tempfile::tempdir;

    fn sample_snapshot() -> FlowSnapshot {
        let mut run = FlowRun::new("orders", Map::new());
        run.data.insert("order_id".into(), json!(42));
        let mut record = StepRecord::started("reserve");
        record.attempts = 1;
        record.complete(Some(json!({"reserved": true})));
        run.step_records.insert("reserve".into(), record);
        run.transition(FlowStatus::Completed).unwrap();

        FlowSnapshot {
            run,
            flow_definition: FlowDefinition::new("orders")
                .with_step(FlowStep::task("reserve", "reserve")),
            snapshot_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("snapshots"));
        let snapshot = sample_snapshot();

        store.save(&snapshot).await.unwrap();
        assert!(store.path_for(&snapshot.run.run_id).exists());

        let loaded = store.load(&snapshot.run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        assert!(store.load(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_files() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let first = sample_snapshot();
        let second = sample_snapshot();
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        tokio::fs::write(dir.path().join("notes.json"), "{}").await.unwrap();
        tokio::fs::write(dir.path().join("readme.txt"), "hi").await.unwrap();

        let mut expected = vec![first.run.run_id, second.run.run_id];
        expected.sort();
        assert_eq!(store.list().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let snapshot = sample_snapshot();
        store.save(&snapshot).await.unwrap();

        assert!(store.delete(&snapshot.run.run_id).await.unwrap());
        assert!(!store.delete(&snapshot.run.run_id).await.unwrap());
        assert!(store.load(&snapshot.run.run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_serialization_error() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        let run_id = Uuid::now_v7();
        tokio::fs::write(store.path_for(&run_id), "{not json").await.unwrap();

        let err = store.load(&run_id).await.unwrap_err();
        assert!(matches!(err, SnapshotStoreError::Serialization(_)));
    }
}
