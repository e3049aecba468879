//! Plugin traits — the Rust expression of the ABI described in §4.2/§6.
//!
//! Each trait mirrors one plugin kind's lifecycle. Async methods return
//! `Pin<Box<dyn Future<...> + Send + '_>>` rather than `async fn in trait`
//! so the traits stay dyn-compatible — plugin-host stores these behind
//! `Box<dyn Trait>` loaded from a `.so`, which requires a concrete vtable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::PluginError;
use crate::ffi::PluginInformation;
use crate::reading::{Reading, ReadingSet};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Destination a push-mode south plugin delivers Readings to. Implemented
/// by the south ingest engine (C4); the plugin never sees the queue or the
/// threshold/timeout flush logic behind it.
pub trait ReadingSink: Send + Sync {
    fn push(&self, reading: Reading) -> BoxFut<'_, Result<(), PluginError>>;
}

/// A south plugin either polls (engine calls `poll` on an interval) or
/// pushes (engine calls `start` once, handing it a `ReadingSink`). A given
/// plugin implements whichever shape fits its device; the other method
/// keeps its default, inert implementation.
pub trait SouthPlugin: Send + Sync {
    fn info(&self) -> PluginInformation;
    fn reconfigure(&self, config_json: &str) -> Result<(), PluginError>;
    fn shutdown(&self) -> BoxFut<'_, Result<(), PluginError>>;

    fn poll(&self) -> BoxFut<'_, Result<Option<Reading>, PluginError>> {
        Box::pin(async { Ok(None) })
    }

    fn start(&self, _sink: Arc<dyn ReadingSink>) -> BoxFut<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }
}

/// A north plugin pulls nothing; the north data loader (C7) hands it
/// batches to `send`. `start`/`shutdown` bracket the plugin's lifetime.
pub trait NorthPlugin: Send + Sync {
    fn info(&self) -> PluginInformation;
    fn start(&self) -> BoxFut<'_, Result<(), PluginError>>;
    fn send(&self, readings: &[Reading]) -> BoxFut<'_, Result<usize, PluginError>>;
    fn reconfigure(&self, config_json: &str) -> Result<(), PluginError>;
    fn shutdown(&self) -> BoxFut<'_, Result<(), PluginError>>;
}

/// Downstream hop in a filter chain. A filter's `init` receives the
/// `Emitter` wired to the next filter's `ingest` (or the pipeline's
/// terminal sink for the last filter) — the closure form Design Note §9
/// asks for in place of the source's void-pointer `OUTPUT_HANDLE`.
///
/// Filters run synchronously (§5: "no internal waits"), so the emitter is
/// a plain callback, not a future.
pub type Emitter = Arc<dyn Fn(ReadingSet) + Send + Sync>;

pub trait FilterPlugin: Send + Sync {
    fn info(&self) -> PluginInformation;
    fn init(&self, config_json: &str, emit: Emitter) -> Result<(), PluginError>;
    fn ingest(&self, set: ReadingSet) -> Result<(), PluginError>;
    fn reconfigure(&self, config_json: &str) -> Result<(), PluginError>;
    fn shutdown(&self) -> Result<(), PluginError>;

    /// Whether `shutdown_save_data` should be called and its result
    /// persisted under `"{service}-{filter}"` (§4.3).
    fn persists_state(&self) -> bool {
        false
    }

    fn shutdown_save_data(&self) -> Option<String> {
        None
    }

    /// Opaque state produced by a previous `shutdown_save_data`, passed
    /// back in before `init` on restart.
    fn restore_data(&self, _data: &str) {}
}
