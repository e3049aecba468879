//! C7: the north data loader. Prefetches readings (or statistics/audit
//! rows) from storage by cursor, buffers them in a fixed-capacity ring,
//! and hands batches to a north plugin.
//!
//! Ground: Design Note §9's two-condition-variable resource model
//! (`not_full`/`not_empty`) re-expressed with `tokio::sync::Notify`, the
//! same idiom `south-ingest`'s `Inbox` uses for producer/consumer
//! back-pressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use edge_api::error::PluginError;
use edge_api::plugins::{Emitter, NorthPlugin};
use edge_api::reading::ReadingSet;
use edge_api::storage::{QueryPredicate, QuerySource, ReadingBuffer, StorageError, StreamCursor};
use filter_pipeline::{FilterDescriptor, FilterPipeline, FilterPipelineError, FilterStateStore};

#[derive(Debug, thiserror::Error)]
pub enum NorthLoaderError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("plugin: {0}")]
    Plugin(#[from] PluginError),
    #[error("filter pipeline: {0}")]
    FilterPipeline(#[from] FilterPipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Readings,
    Statistics,
    Audit,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NorthLoaderConfig {
    pub description: String,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_max_fetch_period_ms")]
    pub max_fetch_period_ms: u64,
    #[serde(default = "default_flush_every")]
    pub flush_every: u64,
    #[serde(default)]
    pub source: SourceMode,
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

fn default_block_size() -> usize {
    500
}
fn default_max_fetch_period_ms() -> u64 {
    30_000
}
fn default_flush_every() -> u64 {
    10
}
fn default_ring_capacity() -> usize {
    10
}

impl NorthLoaderConfig {
    fn max_fetch_period(&self) -> Duration {
        Duration::from_millis(self.max_fetch_period_ms)
    }
}

/// Fixed-capacity ring of `T`, guarded by one mutex plus two `Notify`s —
/// the direct re-expression of the source's two-condition-variable
/// resource model (Design Note §9), not a generic unbounded channel.
pub struct Ring<T> {
    capacity: usize,
    slots: Mutex<VecDeque<T>>,
    not_full: Notify,
    not_empty: Notify,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), slots: Mutex::new(VecDeque::new()), not_full: Notify::new(), not_empty: Notify::new() }
    }

    pub async fn push(&self, item: T) {
        let mut item = Some(item);
        loop {
            {
                let mut slots = self.slots.lock().await;
                if slots.len() < self.capacity {
                    slots.push_back(item.take().expect("push called once per loop iteration"));
                    self.not_empty.notify_one();
                    return;
                }
            }
            self.not_full.notified().await;
        }
    }

    pub async fn pop(&self) -> T {
        loop {
            {
                let mut slots = self.slots.lock().await;
                if let Some(item) = slots.pop_front() {
                    self.not_full.notify_one();
                    return item;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Drains whatever is buffered without waiting — used at shutdown.
    pub async fn drain(&self) -> Vec<T> {
        let mut slots = self.slots.lock().await;
        slots.drain(..).collect()
    }

    pub fn wake_all(&self) {
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }
}

struct FilterStage {
    pipeline: FilterPipeline,
    routed: tokio::sync::mpsc::UnboundedReceiver<ReadingSet>,
}

pub struct NorthLoader {
    storage: Arc<dyn ReadingBuffer>,
    cursor: Arc<dyn StreamCursor>,
    north: Arc<dyn NorthPlugin>,
    ring: Arc<Ring<ReadingSet>>,
    config: Mutex<NorthLoaderConfig>,
    filter: Mutex<Option<FilterStage>>,
    stream_id: AtomicU32,
    last_object: AtomicU64,
    cancel: CancellationToken,
}

impl NorthLoader {
    /// Loads the stream cursor, creating it on first run, and returns a
    /// loader ready to have its producer/consumer tasks spawned.
    pub async fn new(
        service_name: &str,
        storage: Arc<dyn ReadingBuffer>,
        cursor: Arc<dyn StreamCursor>,
        north: Arc<dyn NorthPlugin>,
        config: NorthLoaderConfig,
        existing_stream_id: Option<u32>,
    ) -> Result<Self, NorthLoaderError> {
        let stream_id = match existing_stream_id {
            Some(id) => id,
            None => cursor.create(&config.description).await?,
        };
        let last_object = cursor.load(stream_id).await?;
        tracing::info!(service = service_name, stream_id, last_object, "north loader cursor loaded");

        Ok(Self {
            storage,
            cursor,
            north,
            ring: Arc::new(Ring::new(config.ring_capacity)),
            stream_id: AtomicU32::new(stream_id),
            last_object: AtomicU64::new(last_object),
            config: Mutex::new(config),
            filter: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wires an optional north-side filter chain. The pipeline's terminal
    /// emitter feeds an unbounded channel the producer drains into the
    /// ring — filters run synchronously (§5) and cannot themselves await
    /// the ring's back-pressure, so the channel is the sync/async seam.
    pub async fn set_filter(
        &self,
        service_name: &str,
        descriptors: &[FilterDescriptor],
        state: &dyn FilterStateStore,
    ) -> Result<(), NorthLoaderError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let emitter: Emitter = Arc::new(move |set: ReadingSet| {
            let _ = tx.send(set);
        });
        let pipeline = FilterPipeline::build(service_name, descriptors, emitter, state)?;
        *self.filter.lock().await = Some(FilterStage { pipeline, routed: rx });
        Ok(())
    }

    /// Changes the source mode at runtime; resets the in-memory fetch
    /// cursor but never touches the persisted stream cursor (§4.7).
    pub async fn set_source(&self, source: SourceMode) {
        self.config.lock().await.source = source;
    }

    pub fn spawn_producer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.producer_loop().await })
    }

    pub fn spawn_consumer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.consumer_loop().await })
    }

    async fn producer_loop(self: Arc<Self>) {
        let mut last_fetched = self.last_object.load(Ordering::SeqCst);
        let mut backoff = Duration::from_millis(50);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let (source, block_size, max_period) = {
                let cfg = self.config.lock().await;
                (cfg.source, cfg.block_size, cfg.max_fetch_period())
            };

            let fetched = match source {
                SourceMode::Readings => self.storage.fetch(last_fetched, block_size).await,
                SourceMode::Statistics => {
                    self.storage
                        .query(QueryPredicate { table: QuerySource::Statistics, after_id: last_fetched, limit: block_size })
                        .await
                }
                SourceMode::Audit => {
                    self.storage
                        .query(QueryPredicate { table: QuerySource::Audit, after_id: last_fetched, limit: block_size })
                        .await
                }
            };

            match fetched {
                Ok(set) if !set.is_empty() => {
                    backoff = Duration::from_millis(50);
                    if let Some(max_id) = set.last_id {
                        last_fetched = max_id;
                    }
                    self.route_or_push(set).await;
                }
                Ok(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(max_period);
                }
                Err(e) => {
                    tracing::error!(error = %e, "north loader fetch failed");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                    backoff = (backoff * 2).min(max_period);
                }
            }
        }
        self.ring.wake_all();
    }

    async fn route_or_push(&self, set: ReadingSet) {
        let mut guard = self.filter.lock().await;
        if let Some(stage) = guard.as_mut() {
            stage.pipeline.ingest(set);
            while let Ok(routed) = stage.routed.try_recv() {
                self.ring.push(routed).await;
            }
        } else {
            drop(guard);
            self.ring.push(set).await;
        }
    }

    async fn consumer_loop(self: Arc<Self>) {
        let flush_every = self.config.lock().await.flush_every;
        let mut dirty = 0u64;

        loop {
            let set = tokio::select! {
                s = self.ring.pop() => s,
                _ = self.cancel.cancelled() => break,
            };

            match self.north.send(&set.readings).await {
                Ok(sent) => {
                    if let Some(max_id) = set.last_id {
                        self.last_object.fetch_max(max_id, Ordering::SeqCst);
                    }
                    dirty += 1;
                    tracing::debug!(sent, "north send ok");
                    if dirty >= flush_every {
                        self.flush_cursor().await;
                        dirty = 0;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "north send failed, batch dropped, cursor not advanced");
                }
            }
        }

        for remaining in self.ring.drain().await {
            tracing::warn!(dropped = remaining.readings.len(), "north loader shutdown: ring batch discarded");
        }
        self.flush_cursor().await;
    }

    async fn flush_cursor(&self) {
        let stream_id = self.stream_id.load(Ordering::SeqCst);
        let last_object = self.last_object.load(Ordering::SeqCst);
        if let Err(e) = self.cursor.flush(stream_id, last_object).await {
            tracing::error!(error = %e, "north loader cursor flush failed");
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.ring.wake_all();
        self.flush_cursor().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_api::reading::Reading;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use tokio::sync::Mutex as TokioMutex;

    struct MemoryBuffer {
        rows: TokioMutex<BTreeMap<u64, Reading>>,
        next_id: StdAtomicU64,
    }

    impl MemoryBuffer {
        fn new(seed: Vec<Reading>) -> Self {
            let mut rows = BTreeMap::new();
            let mut next = 1u64;
            for mut r in seed {
                r.id = Some(next);
                rows.insert(next, r);
                next += 1;
            }
            Self { rows: TokioMutex::new(rows), next_id: StdAtomicU64::new(next) }
        }
    }

    impl ReadingBuffer for MemoryBuffer {
        fn append(
            &self,
            batch: Vec<Reading>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize, StorageError>> + Send + '_>> {
            Box::pin(async move {
                let mut rows = self.rows.lock().await;
                let n = batch.len();
                for mut r in batch {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    r.id = Some(id);
                    rows.insert(id, r);
                }
                Ok(n)
            })
        }

        fn fetch(
            &self,
            after_id: u64,
            max_count: usize,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ReadingSet, StorageError>> + Send + '_>> {
            Box::pin(async move {
                let rows = self.rows.lock().await;
                let readings: Vec<Reading> =
                    rows.range((after_id + 1)..).take(max_count).map(|(_, r)| r.clone()).collect();
                Ok(ReadingSet::new(readings))
            })
        }

        fn query(
            &self,
            _predicate: QueryPredicate,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ReadingSet, StorageError>> + Send + '_>> {
            Box::pin(async move { Ok(ReadingSet::new(vec![])) })
        }

        fn purge_by_age(
            &self,
            _seconds: u64,
            _retain_unsent: bool,
            _last_sent: u64,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<edge_api::storage::PurgeResult, StorageError>> + Send + '_>>
        {
            Box::pin(async move { Ok(Default::default()) })
        }

        fn purge_by_rows(
            &self,
            _target_rows: u64,
            _retain_unsent: bool,
            _last_sent: u64,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<edge_api::storage::PurgeResult, StorageError>> + Send + '_>>
        {
            Box::pin(async move { Ok(Default::default()) })
        }

        fn purge_by_asset(
            &self,
            _asset: &str,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, StorageError>> + Send + '_>> {
            Box::pin(async move { Ok(0) })
        }

        fn stream_append(
            &self,
            batch: Vec<Reading>,
            _commit: bool,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize, StorageError>> + Send + '_>> {
            self.append(batch)
        }

        fn create_schema(
            &self,
            _definition: edge_api::storage::SchemaDefinition,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + '_>> {
            Box::pin(async move { Ok(()) })
        }
    }

    struct MemoryCursor {
        last_object: StdAtomicU64,
        next_id: StdAtomicU64,
    }

    impl MemoryCursor {
        fn new() -> Self {
            Self { last_object: StdAtomicU64::new(0), next_id: StdAtomicU64::new(1) }
        }
    }

    impl StreamCursor for MemoryCursor {
        fn load(&self, _stream_id: u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, StorageError>> + Send + '_>> {
            Box::pin(async move { Ok(self.last_object.load(Ordering::SeqCst)) })
        }

        fn flush(
            &self,
            _stream_id: u32,
            last_object: u64,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + '_>> {
            Box::pin(async move {
                self.last_object.fetch_max(last_object, Ordering::SeqCst);
                Ok(())
            })
        }

        fn create(
            &self,
            _description: &str,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32, StorageError>> + Send + '_>> {
            Box::pin(async move { Ok(self.next_id.fetch_add(1, Ordering::SeqCst) as u32) })
        }
    }

    struct CountingNorth {
        sent: StdAtomicU64,
    }

    impl NorthPlugin for CountingNorth {
        fn info(&self) -> edge_api::ffi::PluginInformation {
            edge_api::ffi::PluginInformation {
                name: "counting-north".into(),
                version: "0.1.0".into(),
                kind: edge_api::ffi::PluginKind::North,
                interface_version: "2.0.0".into(),
                flags: 0,
                config_default_json: serde_json::json!({}),
            }
        }
        fn start(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), PluginError>> + Send + '_>> {
            Box::pin(async move { Ok(()) })
        }
        fn send(
            &self,
            readings: &[Reading],
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize, PluginError>> + Send + '_>> {
            let n = readings.len();
            Box::pin(async move {
                self.sent.fetch_add(n as u64, Ordering::SeqCst);
                Ok(n)
            })
        }
        fn reconfigure(&self, _config_json: &str) -> Result<(), PluginError> {
            Ok(())
        }
        fn shutdown(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), PluginError>> + Send + '_>> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn reading(asset: &str) -> Reading {
        Reading { asset: asset.into(), user_ts: chrono::Utc::now(), system_ts: chrono::Utc::now(), id: None, uuid: None, datapoints: vec![] }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn producer_and_consumer_drain_backlog_to_north() {
        let seeded = vec![reading("a"), reading("b"), reading("c")];
        let storage: Arc<dyn ReadingBuffer> = Arc::new(MemoryBuffer::new(seeded));
        let cursor: Arc<dyn StreamCursor> = Arc::new(MemoryCursor::new());
        let north = Arc::new(CountingNorth { sent: StdAtomicU64::new(0) });

        let config = NorthLoaderConfig {
            description: "test-stream".into(),
            block_size: 10,
            max_fetch_period_ms: 200,
            flush_every: 1,
            source: SourceMode::Readings,
            ring_capacity: 4,
        };

        let loader = Arc::new(NorthLoader::new("svc", storage, cursor.clone(), north.clone(), config, None).await.unwrap());
        let producer = loader.spawn_producer();
        let consumer = loader.spawn_consumer();

        tokio::time::sleep(Duration::from_millis(100)).await;
        loader.shutdown().await;
        let _ = tokio::join!(producer, consumer);

        assert_eq!(north.sent.load(Ordering::SeqCst), 3);
        assert_eq!(cursor.load(1).await.unwrap(), 3);
    }
}
