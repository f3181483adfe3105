//!
//! Workcell State File - file-backed flow record store
//!
//! Active flow records live in one JSON file so the cell can rebuild
//! its flows after a restart. Every save rewrites the whole file
//! through a temporary sibling and an atomic rename; a crash mid-save
//! leaves the previous file intact. The record set is small (a handful
//! of active flows at most), so whole-file rewrites stay cheap.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use workcell_core::domain::flow::FlowRecord;
use workcell_core::{CoreError, FlowId, FlowStore};

/// JSON-file-backed [`FlowStore`]
pub struct FileFlowStore {
    path: PathBuf,
    // Serializes the read-modify-write cycle behind every mutation
    lock: Mutex<()>,
}

impl FileFlowStore {
    /// Store backed by the file at `path`; the file and its parent
    /// directory are created on first save
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileFlowStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The file this store reads and writes
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<FlowRecord>, CoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(CoreError::StateStoreError(format!(
                    "reading {}: {}",
                    self.path.display(),
                    err
                )))
            }
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            CoreError::StateStoreError(format!("parsing {}: {}", self.path.display(), err))
        })
    }

    async fn write_all(&self, records: &[FlowRecord]) -> Result<(), CoreError> {
        let json = serde_json::to_vec_pretty(records)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_replacing(&path, &json))
            .await
            .map_err(|err| CoreError::StateStoreError(format!("store writer failed: {}", err)))?
    }
}

/// Write `bytes` to `path` through a temporary sibling and a rename
fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let context = |err: std::io::Error| {
        CoreError::StateStoreError(format!("writing {}: {}", path.display(), err))
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(context)?;
            parent
        }
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(context)?;
    file.write_all(bytes).map_err(context)?;
    file.as_file().sync_all().map_err(context)?;
    file.persist(path).map_err(|err| {
        CoreError::StateStoreError(format!("replacing {}: {}", path.display(), err.error))
    })?;
    Ok(())
}

#[async_trait]
impl FlowStore for FileFlowStore {
    async fn save(&self, record: &FlowRecord) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        match records
            .iter_mut()
            .find(|existing| existing.flow_id == record.flow_id)
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_all(&records).await?;
        debug!(flow = %record.flow_id, "flow record saved");
        Ok(())
    }

    async fn load(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>, CoreError> {
        let _guard = self.lock.lock().await;
        let records = self.read_all().await?;
        Ok(records.into_iter().find(|record| &record.flow_id == flow_id))
    }

    async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let before = records.len();
        records.retain(|record| &record.flow_id != flow_id);
        if records.len() == before {
            return Ok(());
        }
        self.write_all(&records).await?;
        debug!(flow = %flow_id, "flow record deleted");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FlowRecord>, CoreError> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workcell_core::domain::flow::{FlowParams, FlowState};

    fn record(flow_id: &str, step: usize) -> FlowRecord {
        FlowRecord {
            flow_id: FlowId::from(flow_id),
            current_step: step,
            state: FlowState::Running,
            params: FlowParams::Input {
                shelf: 1,
                chamber: 3,
                quantity: 2,
                confirm_first: false,
            },
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> FileFlowStore {
        FileFlowStore::new(dir.path().join("flows.json"))
    }

    #[tokio::test]
    async fn test_records_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&record("f1", 2)).await.unwrap();

        let reopened = store_in(&dir);
        let loaded = reopened.load(&FlowId::from("f1")).await.unwrap();
        assert_eq!(loaded, Some(record("f1", 2)));
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store.list().await.unwrap().is_empty());
        assert!(store.load(&FlowId::from("f1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_by_flow_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&record("f1", 0)).await.unwrap();
        store.save(&record("f1", 5)).await.unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].current_step, 5);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&record("f1", 0)).await.unwrap();

        store.delete(&FlowId::from("f1")).await.unwrap();
        store.delete(&FlowId::from("f1")).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&record("f1", 0)).await.unwrap();
        store.save(&record("f2", 3)).await.unwrap();

        let mut ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.flow_id.0)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["f1".to_string(), "f2".to_string()]);
    }

    #[tokio::test]
    async fn test_parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileFlowStore::new(dir.path().join("state/nested/flows.json"));
        store.save(&record("f1", 0)).await.unwrap();

        assert!(store.path().exists());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported_not_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.json");
        std::fs::write(&path, b"not json {").unwrap();

        let store = FileFlowStore::new(&path);
        let err = store.list().await.unwrap_err();
        assert!(matches!(err, CoreError::StateStoreError(_)), "got {:?}", err);

        // A save must not quietly flatten the evidence either.
        let err = store.save(&record("f1", 0)).await.unwrap_err();
        assert!(matches!(err, CoreError::StateStoreError(_)), "got {:?}", err);
        assert_eq!(std::fs::read(&path).unwrap(), b"not json {");
    }
}
