//! Persistence boundary for flow records.
//!
//! The engine persists through this trait only; the file-backed
//! implementation lives in its own crate, and an in-memory one ships behind
//! the `testing` feature for unit and engine tests.

use async_trait::async_trait;

use crate::domain::flow::FlowRecord;
use crate::error::CoreError;
use crate::types::FlowId;

/// Durable storage for active flow records
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert or replace one record
    async fn save(&self, record: &FlowRecord) -> Result<(), CoreError>;

    /// Load one record by id
    async fn load(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>, CoreError>;

    /// Remove one record; removing an absent id is not an error
    async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError>;

    /// Every stored record, in no particular order
    async fn list(&self) -> Result<Vec<FlowRecord>, CoreError>;
}

/// In-memory store for tests
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;

    /// DashMap-backed [`FlowStore`]
    #[derive(Default)]
    pub struct InMemoryFlowStore {
        records: DashMap<FlowId, FlowRecord>,
    }

    impl InMemoryFlowStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored records
        pub fn len(&self) -> usize {
            self.records.len()
        }

        /// True when nothing is stored
        pub fn is_empty(&self) -> bool {
            self.records.is_empty()
        }
    }

    #[async_trait]
    impl FlowStore for InMemoryFlowStore {
        async fn save(&self, record: &FlowRecord) -> Result<(), CoreError> {
            self.records.insert(record.flow_id.clone(), record.clone());
            Ok(())
        }

        async fn load(&self, flow_id: &FlowId) -> Result<Option<FlowRecord>, CoreError> {
            Ok(self.records.get(flow_id).map(|r| r.clone()))
        }

        async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError> {
            self.records.remove(flow_id);
            Ok(())
        }

        async fn list(&self) -> Result<Vec<FlowRecord>, CoreError> {
            Ok(self.records.iter().map(|r| r.clone()).collect())
        }
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::memory::InMemoryFlowStore;
    use super::*;
    use crate::domain::flow::{FlowParams, FlowState};

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

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let store = InMemoryFlowStore::new();
        let r = record("f1", 2);
        store.save(&r).await.unwrap();

        let loaded = store.load(&FlowId::from("f1")).await.unwrap();
        assert_eq!(loaded, Some(r));
        assert!(store.load(&FlowId::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_existing() {
        let store = InMemoryFlowStore::new();
        store.save(&record("f1", 0)).await.unwrap();
        store.save(&record("f1", 5)).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load(&FlowId::from("f1")).await.unwrap().unwrap();
        assert_eq!(loaded.current_step, 5);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryFlowStore::new();
        store.save(&record("f1", 0)).await.unwrap();
        store.delete(&FlowId::from("f1")).await.unwrap();
        store.delete(&FlowId::from("f1")).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_everything() {
        let store = InMemoryFlowStore::new();
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
}
