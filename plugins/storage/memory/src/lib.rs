//! In-memory reading buffer: `BTreeMap<u64, Reading>` plus an `AtomicU64`
//! id counter. Zero-dependency default for tests and small deployments;
//! `storage-sqlite` is the durable backend.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use edge_api::ffi::{parse_plugin_config_opt, plugin_err, plugin_ok, PluginCreateResult};
use edge_api::reading::{Reading, ReadingSet};
use edge_api::storage::{PurgeResult, QueryPredicate, QuerySource, ReadingBuffer, SchemaDefinition, StorageError};
use edge_api::{edge_abi_version_fn, edge_destroy_fn};

#[derive(Debug, Default, serde::Deserialize)]
pub struct MemoryStorageConfig {
    #[serde(default)]
    pub max_rows: Option<u64>,
}

pub struct MemoryStorage {
    rows: RwLock<BTreeMap<u64, Reading>>,
    next_id: AtomicU64,
    max_rows: Option<u64>,
}

impl MemoryStorage {
    pub fn new(config: MemoryStorageConfig) -> Self {
        Self { rows: RwLock::new(BTreeMap::new()), next_id: AtomicU64::new(1), max_rows: config.max_rows }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }
}

impl ReadingBuffer for MemoryStorage {
    fn append(&self, batch: Vec<Reading>) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let n = batch.len();
            for mut r in batch {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                r.id = Some(id);
                rows.insert(id, r);
            }
            if let Some(max) = self.max_rows {
                while rows.len() as u64 > max {
                    if let Some((&oldest, _)) = rows.iter().next() {
                        rows.remove(&oldest);
                    } else {
                        break;
                    }
                }
            }
            Ok(n)
        })
    }

    fn fetch(
        &self,
        after_id: u64,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ReadingSet, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            let readings: Vec<Reading> =
                rows.range((std::ops::Bound::Excluded(after_id), std::ops::Bound::Unbounded))
                    .take(max_count)
                    .map(|(_, r)| r.clone())
                    .collect();
            Ok(ReadingSet::new(readings))
        })
    }

    fn query(
        &self,
        predicate: QueryPredicate,
    ) -> Pin<Box<dyn Future<Output = Result<ReadingSet, StorageError>> + Send + '_>> {
        Box::pin(async move {
            if predicate.table != QuerySource::Readings {
                return Err(StorageError::NotFound(
                    "in-memory storage holds readings only, not statistics/audit rows".into(),
                ));
            }
            let rows = self.rows.read().await;
            let readings: Vec<Reading> = rows
                .range((std::ops::Bound::Excluded(predicate.after_id), std::ops::Bound::Unbounded))
                .take(predicate.limit.max(1))
                .map(|(_, r)| r.clone())
                .collect();
            Ok(ReadingSet::new(readings))
        })
    }

    fn purge_by_age(
        &self,
        seconds: u64,
        retain_unsent: bool,
        last_sent: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PurgeResult, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let cutoff = chrono::Utc::now() - chrono::Duration::seconds(seconds as i64);
            let mut rows = self.rows.write().await;
            let mut result = PurgeResult::default();
            let stale: Vec<u64> = rows
                .iter()
                .filter(|(_, r)| r.user_ts < cutoff)
                .map(|(&id, _)| id)
                .collect();
            for id in stale {
                if retain_unsent && id > last_sent {
                    result.unsent_retained += 1;
                    continue;
                }
                if id > last_sent {
                    result.unsent_purged += 1;
                }
                rows.remove(&id);
                result.removed += 1;
            }
            result.readings = rows.len() as u64;
            Ok(result)
        })
    }

    fn purge_by_rows(
        &self,
        target_rows: u64,
        retain_unsent: bool,
        last_sent: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PurgeResult, StorageError>> + Send + '_>> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let mut result = PurgeResult::default();
            while rows.len() as u64 > target_rows {
                let Some((&oldest, _)) = rows.iter().next() else { break };
                if retain_unsent && oldest > last_sent {
                    result.unsent_retained += 1;
                    break;
                }
                if oldest > last_sent {
                    result.unsent_purged += 1;
                }
                rows.remove(&oldest);
                result.removed += 1;
            }
            result.readings = rows.len() as u64;
            Ok(result)
        })
    }

    fn purge_by_asset(&self, asset: &str) -> Pin<Box<dyn Future<Output = Result<u64, StorageError>> + Send + '_>> {
        let asset = asset.to_string();
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let before = rows.len();
            rows.retain(|_, r| r.asset != asset);
            Ok((before - rows.len()) as u64)
        })
    }

    fn stream_append(
        &self,
        batch: Vec<Reading>,
        _commit: bool,
    ) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + '_>> {
        self.append(batch)
    }

    fn create_schema(
        &self,
        _definition: SchemaDefinition,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// # Safety
/// `config_json_ptr` must point to `config_json_len` valid UTF-8 bytes, or
/// be null with `config_json_len == 0`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_create_storage(config_json_ptr: *const u8, config_json_len: usize) -> PluginCreateResult {
    let config: MemoryStorageConfig = match unsafe { parse_plugin_config_opt(config_json_ptr, config_json_len) } {
        Ok(c) => c,
        Err(e) => return plugin_err(e.to_string()),
    };
    plugin_ok(Box::new(MemoryStorage::new(config)) as Box<dyn ReadingBuffer>)
}

edge_destroy_fn!(edge_destroy_storage, ReadingBuffer);
edge_abi_version_fn!();

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::reading::DatapointValue;

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let storage = MemoryStorage::default();
        storage
            .append(vec![
                Reading::new("a", ("x".into(), DatapointValue::Integer(1))),
                Reading::new("b", ("x".into(), DatapointValue::Integer(2))),
            ])
            .await
            .unwrap();
        let set = storage.fetch(0, 10).await.unwrap();
        assert_eq!(set.readings.len(), 2);
        assert_eq!(set.readings[0].id, Some(1));
        assert_eq!(set.readings[1].id, Some(2));
    }

    #[tokio::test]
    async fn fetch_after_id_excludes_seen_rows() {
        let storage = MemoryStorage::default();
        storage
            .append(vec![
                Reading::new("a", ("x".into(), DatapointValue::Integer(1))),
                Reading::new("a", ("x".into(), DatapointValue::Integer(2))),
                Reading::new("a", ("x".into(), DatapointValue::Integer(3))),
            ])
            .await
            .unwrap();
        let set = storage.fetch(1, 10).await.unwrap();
        assert_eq!(set.readings.len(), 2);
        assert_eq!(set.last_id, Some(3));
    }

    #[tokio::test]
    async fn retain_unsent_purge_never_removes_above_last_sent() {
        let storage = MemoryStorage::default();
        storage
            .append(vec![Reading::new("a", ("x".into(), DatapointValue::Integer(1)))])
            .await
            .unwrap();
        let result = storage.purge_by_rows(0, true, 0).await.unwrap();
        assert_eq!(result.removed, 0);
        assert_eq!(result.unsent_retained, 1);
    }
}
