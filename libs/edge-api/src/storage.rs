//! The storage-side contract (C5 reading buffer, C9 stream cursor) that the
//! data plane requires. A concrete backend (in-memory, sqlite, a storage
//! plugin loaded dynamically) implements these traits; callers never touch
//! SQL or a specific engine's connection type directly.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::reading::{Reading, ReadingSet};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection: {0}")]
    Connection(String),
    /// Lock/busy on the backing store; caller may retry with back-off.
    #[error("transient (busy/locked): {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("schema: {0}")]
    Schema(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A richer predicate for statistics/audit sources (§4.5 `query`).
#[derive(Debug, Clone, Default)]
pub struct QueryPredicate {
    pub table: QuerySource,
    pub after_id: u64,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QuerySource {
    #[default]
    Readings,
    /// `statistics_history`, projected `key -> asset_code, history_ts -> user_ts`.
    Statistics,
    /// `log`, projected `code -> asset_code, ts -> user_ts, log -> reading`.
    Audit,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PurgeResult {
    pub removed: u64,
    pub unsent_purged: u64,
    pub unsent_retained: u64,
    pub readings: u64,
}

/// Add/drop tables, columns, and indexes — the shape `create_schema`
/// diffs against the `service_schema` registry row (§4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub version: u32,
    pub tables: Vec<TableDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub sql_type: String,
}

/// C5: append-on-write reading buffer.
///
/// Invariants the implementation must uphold: a concurrent append and
/// fetch are serializable; fetch never returns a non-durable id; a
/// retain-unsent purge never removes id > last_sent.
pub trait ReadingBuffer: Send + Sync {
    fn append(&self, batch: Vec<Reading>) -> BoxFut<'_, Result<usize, StorageError>>;

    fn fetch(&self, after_id: u64, max_count: usize) -> BoxFut<'_, Result<ReadingSet, StorageError>>;

    fn query(&self, predicate: QueryPredicate) -> BoxFut<'_, Result<ReadingSet, StorageError>>;

    fn purge_by_age(
        &self,
        seconds: u64,
        retain_unsent: bool,
        last_sent: u64,
    ) -> BoxFut<'_, Result<PurgeResult, StorageError>>;

    fn purge_by_rows(
        &self,
        target_rows: u64,
        retain_unsent: bool,
        last_sent: u64,
    ) -> BoxFut<'_, Result<PurgeResult, StorageError>>;

    fn purge_by_asset(&self, asset: &str) -> BoxFut<'_, Result<u64, StorageError>>;

    /// Batched append used by the stream-handler ingest path (C6).
    /// Durable on return when `commit` is true.
    fn stream_append(&self, batch: Vec<Reading>, commit: bool) -> BoxFut<'_, Result<usize, StorageError>>;

    fn create_schema(&self, definition: SchemaDefinition) -> BoxFut<'_, Result<(), StorageError>>;
}

/// C9: durable per-stream cursor.
pub trait StreamCursor: Send + Sync {
    fn load(&self, stream_id: u32) -> BoxFut<'_, Result<u64, StorageError>>;

    /// Idempotent: re-flushing the same value is a no-op write, not an error.
    fn flush(&self, stream_id: u32, last_object: u64) -> BoxFut<'_, Result<(), StorageError>>;

    /// Atomically allocates the next stream id.
    fn create(&self, description: &str) -> BoxFut<'_, Result<u32, StorageError>>;
}

/// Asset-tracking 4-tuple (§3); uniqueness is on the whole tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetTrackingTuple {
    pub service: String,
    pub plugin: String,
    pub asset: String,
    pub event: AssetTrackingEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetTrackingEvent {
    Ingest,
    Egress,
    Store,
}

/// Persists asset-tracking tuples and statistics counters on first sight.
/// Category CRUD and the registry HTTP surface are out of scope (§1); this
/// trait is the seam a real management API would sit behind.
pub trait ManagementCollaborator: Send + Sync {
    fn record_asset_tracking(&self, tuple: AssetTrackingTuple) -> BoxFut<'_, Result<(), StorageError>>;
    fn increment_statistic(&self, key: &str, delta: u64) -> BoxFut<'_, Result<(), StorageError>>;
}
