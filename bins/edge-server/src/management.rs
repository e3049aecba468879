//! In-process stand-ins for the collaborators the data plane depends on but
//! whose own CRUD surface is out of scope: asset tracking / statistics
//! (`ManagementCollaborator`), the `streams` cursor table (`StreamCursor`),
//! and persisted filter state (`FilterStateStore`). A deployment with a
//! real admin API backs these with its configuration database instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use edge_api::storage::{AssetTrackingTuple, ManagementCollaborator, StorageError, StreamCursor};
use filter_pipeline::FilterStateStore;

#[derive(Default)]
pub struct InMemoryManagement {
    seen_assets: Mutex<std::collections::HashSet<AssetTrackingTuple>>,
    statistics: Mutex<HashMap<String, u64>>,
}

impl ManagementCollaborator for InMemoryManagement {
    fn record_asset_tracking(
        &self,
        tuple: AssetTrackingTuple,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + '_>> {
        Box::pin(async move {
            self.seen_assets.lock().unwrap().insert(tuple);
            Ok(())
        })
    }

    fn increment_statistic(
        &self,
        key: &str,
        delta: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            *self.statistics.lock().unwrap().entry(key).or_insert(0) += delta;
            Ok(())
        })
    }
}

pub struct InMemoryStreamCursor {
    next_id: AtomicU32,
    descriptions: Mutex<HashMap<String, u32>>,
    last_objects: Mutex<HashMap<u32, u64>>,
}

impl Default for InMemoryStreamCursor {
    fn default() -> Self {
        Self { next_id: AtomicU32::new(1), descriptions: Mutex::new(HashMap::new()), last_objects: Mutex::new(HashMap::new()) }
    }
}

impl StreamCursor for InMemoryStreamCursor {
    fn load(&self, stream_id: u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, StorageError>> + Send + '_>> {
        Box::pin(async move { Ok(self.last_objects.lock().unwrap().get(&stream_id).copied().unwrap_or(0)) })
    }

    fn flush(
        &self,
        stream_id: u32,
        last_object: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + '_>> {
        Box::pin(async move {
            let mut objects = self.last_objects.lock().unwrap();
            let entry = objects.entry(stream_id).or_insert(0);
            *entry = (*entry).max(last_object);
            Ok(())
        })
    }

    fn create(
        &self,
        description: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32, StorageError>> + Send + '_>> {
        let description = description.to_string();
        Box::pin(async move {
            let mut descriptions = self.descriptions.lock().unwrap();
            if let Some(&id) = descriptions.get(&description) {
                return Ok(id);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            descriptions.insert(description, id);
            Ok(id)
        })
    }
}

#[derive(Default)]
pub struct InMemoryFilterStateStore {
    saved: Mutex<HashMap<String, String>>,
}

impl FilterStateStore for InMemoryFilterStateStore {
    fn load(&self, key: &str) -> Option<String> {
        self.saved.lock().unwrap().get(key).cloned()
    }

    fn save(&self, key: &str, data: String) {
        self.saved.lock().unwrap().insert(key.to_string(), data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_cursor_create_is_idempotent_per_description() {
        let cursor = InMemoryStreamCursor::default();
        let a = cursor.create("north-omf").await.unwrap();
        let b = cursor.create("north-omf").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn stream_cursor_flush_never_regresses() {
        let cursor = InMemoryStreamCursor::default();
        let id = cursor.create("s").await.unwrap();
        cursor.flush(id, 10).await.unwrap();
        cursor.flush(id, 3).await.unwrap();
        assert_eq!(cursor.load(id).await.unwrap(), 10);
    }
}
