use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{config_json_or_empty, FilterDeclaration, NorthDeclaration, ServeArgs, ServiceConfig};
use crate::error::ServerError;
use crate::management::{InMemoryFilterStateStore, InMemoryManagement, InMemoryStreamCursor};

use edge_api::plugins::{Emitter, NorthPlugin, SouthPlugin};
use edge_api::reading::ReadingSet;
use edge_api::storage::{ManagementCollaborator, ReadingBuffer, StreamCursor};
use filter_pipeline::{FilterDescriptor, FilterPipeline, FilterStateStore};
use north_loader::NorthLoader;
use plugin_host::{PluginNorth, PluginSouth, PluginStorage};
use south_ingest::SouthIngestEngine;
use storage_memory::MemoryStorage;

fn to_descriptors(decls: &[FilterDeclaration]) -> Vec<FilterDescriptor> {
    decls
        .iter()
        .map(|d| FilterDescriptor { category: d.category.clone(), plugin: d.plugin.clone(), config: d.config.clone() })
        .collect()
}

/// Bridges the south filter chain's synchronous terminal emitter to the
/// async `storage.append` call — the same sync/async seam `north-loader`
/// uses for its own filter stage, since `Emitter` cannot itself `.await`.
fn storage_terminal_emitter(storage: Arc<dyn ReadingBuffer>, management: Arc<dyn ManagementCollaborator>) -> Emitter {
    Arc::new(move |set: ReadingSet| {
        let storage = storage.clone();
        let management = management.clone();
        tokio::spawn(async move {
            let count = set.readings.len() as u64;
            match storage.append(set.readings).await {
                Ok(_) => {
                    let _ = management.increment_statistic("READINGS", count).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "south filter pipeline: storage append failed, batch dropped");
                    let _ = management.increment_statistic("DISCARDED", count).await;
                }
            }
        });
    })
}

async fn load_north(
    decl: &NorthDeclaration,
    service_name: &str,
    storage: Arc<dyn ReadingBuffer>,
    cursor: Arc<dyn StreamCursor>,
    filter_state: &dyn FilterStateStore,
    token: CancellationToken,
) -> Result<(Arc<NorthLoader>, JoinHandle<()>, JoinHandle<()>), ServerError> {
    let config_json = config_json_or_empty(&decl.config)?;
    let plugin = PluginNorth::load(&decl.plugin, &config_json)?;
    let north: Arc<dyn NorthPlugin> = Arc::new(plugin);
    north.start().await?;

    let loader = Arc::new(NorthLoader::new(service_name, storage, cursor, north, decl.loader.clone(), None).await?);

    if !decl.filters.is_empty() {
        loader.set_filter(service_name, &to_descriptors(&decl.filters), filter_state).await?;
    }

    // Loaders share the service-wide cancellation token so a single Ctrl+C
    // stops every producer/consumer pair together.
    let cancel = loader.cancel_token();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            token.cancelled().await;
            cancel.cancel();
        }
    });

    let producer = loader.spawn_producer();
    let consumer = loader.spawn_consumer();
    tracing::info!(north = %decl.name, plugin = %decl.plugin, "spawned north loader");
    Ok((loader, producer, consumer))
}

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("edge-server starting");

    let config = ServiceConfig::load(&args.config)?;
    tracing::info!(config = %args.config, service = %config.service_name, "loaded config");

    let token = CancellationToken::new();

    let storage: Arc<dyn ReadingBuffer> = match &config.storage {
        Some(decl) => {
            let config_json = config_json_or_empty(&decl.config)?;
            Arc::new(PluginStorage::load(&decl.plugin, &config_json)?)
        }
        None => Arc::new(MemoryStorage::default()),
    };
    let management: Arc<dyn ManagementCollaborator> = Arc::new(InMemoryManagement::default());
    let stream_cursor: Arc<dyn StreamCursor> = Arc::new(InMemoryStreamCursor::default());
    let filter_state = InMemoryFilterStateStore::default();

    // --- South plugin + ingest engine ---
    let south_config_json = config_json_or_empty(&config.south.config)?;
    let south_plugin = PluginSouth::load(&config.south.plugin, &south_config_json)?;
    let south_plugin: Arc<dyn SouthPlugin> = Arc::new(south_plugin);

    let south_filter = if config.filters.is_empty() {
        None
    } else {
        let terminal = storage_terminal_emitter(storage.clone(), management.clone());
        let pipeline =
            FilterPipeline::build(&config.service_name, &to_descriptors(&config.filters), terminal, &filter_state)?;
        Some(Arc::new(Mutex::new(pipeline)))
    };

    let engine = SouthIngestEngine::new(
        config.service_name.clone(),
        config.south.plugin.clone(),
        storage.clone(),
        south_filter,
        management.clone(),
        config.south.ingest_config(),
    );

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.push(engine.clone().spawn_flush_worker(token.clone()));
    handles.push(engine.clone().spawn_poll_worker(
        south_plugin.clone(),
        Duration::from_millis(config.south.poll_interval_ms),
        token.clone(),
    ));
    handles.push(engine.clone().spawn_stats_writer(Duration::from_secs(5), token.clone()));

    let push_sink = engine.sink();
    let push_plugin = south_plugin.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = push_plugin.start(push_sink).await {
            tracing::error!(error = ?e, "south plugin start (push mode) error");
        }
    }));
    tracing::info!(plugin = %config.south.plugin, "spawned south ingest engine");

    // --- Stream handler (bulk TCP ingest) ---
    if config.stream_enabled {
        let listener = stream_handler::create_stream(storage.clone(), management.clone(), token.clone())?;
        tracing::info!(port = listener.port, "stream handler listening");
    }

    // --- North loaders ---
    let mut north_loaders: Vec<Arc<NorthLoader>> = Vec::new();
    for decl in &config.north {
        let (loader, producer, consumer) = load_north(
            decl,
            &config.service_name,
            storage.clone(),
            stream_cursor.clone(),
            &filter_state,
            token.clone(),
        )
        .await?;
        north_loaders.push(loader);
        handles.push(producer);
        handles.push(consumer);
    }

    tracing::info!("edge-server ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    token.cancel();

    for loader in &north_loaders {
        loader.shutdown().await;
    }
    if let Err(e) = south_plugin.shutdown().await {
        tracing::error!(error = ?e, "south plugin shutdown error");
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    for h in &handles {
        if !h.is_finished() {
            h.abort();
        }
    }
    for h in handles {
        let _ = h.await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}
