//! Dynamic loading of `.so` plugins (C2).
//!
//! Each plugin kind exports exactly one creation symbol returning a
//! thin-pointer-boxed trait object (`edge_api::ffi::plugin_ok`/`plugin_err`);
//! the fixed method set a kind must implement (`info`/`init`/`poll`/... for
//! south, etc.) lives on the Rust trait itself rather than as one `extern
//! "C"` function per method — the trait vtable *is* the ABI once the create
//! symbol hands a boxed trait object back across the library boundary.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use libloading::{Library, Symbol};

use edge_api::error::PluginError;
use edge_api::ffi::{AbiVersionFn, CreatePluginFn, PluginInformation, EDGE_ABI_VERSION};
use edge_api::plugins::{Emitter, FilterPlugin, NorthPlugin, ReadingSink, SouthPlugin};
use edge_api::reading::{Reading, ReadingSet};
use edge_api::storage::{PurgeResult, QueryPredicate, ReadingBuffer, SchemaDefinition, StorageError};

/// Load a `.so`, check its ABI version, resolve `create_symbol`, and call
/// it with `config_json`. The returned library must outlive the boxed
/// trait object — callers keep both together in a wrapper struct.
///
/// # Safety
/// `create_symbol` must name a function matching `CreatePluginFn` that
/// returns a `Box<Box<dyn T>>` thin pointer on success.
unsafe fn load_plugin<T: ?Sized>(
    plugin_path: &str,
    create_symbol: &[u8],
    config_json: &str,
) -> Result<(Box<T>, Library), PluginError> {
    let lib = unsafe { Library::new(plugin_path) }
        .map_err(|e| PluginError::config(format!("failed to load plugin '{plugin_path}': {e}")))?;

    let version_fn: Symbol<AbiVersionFn> = unsafe { lib.get(b"edge_abi_version") }.map_err(|_| {
        PluginError::config(format!(
            "plugin '{plugin_path}' does not export 'edge_abi_version' — \
             likely built against a different edge-api. Rebuild the plugin."
        ))
    })?;
    let plugin_version = unsafe { version_fn() };
    if plugin_version != EDGE_ABI_VERSION {
        return Err(PluginError::config(format!(
            "ABI version mismatch for plugin '{plugin_path}': plugin has version \
             {plugin_version}, host expects {EDGE_ABI_VERSION}. Rebuild the plugin."
        )));
    }

    let create_fn: Symbol<CreatePluginFn> = unsafe { lib.get(create_symbol) }.map_err(|e| {
        let sym = String::from_utf8_lossy(create_symbol);
        PluginError::config(format!("symbol '{sym}' not found in '{plugin_path}': {e}"))
    })?;

    let result = unsafe { create_fn(config_json.as_ptr(), config_json.len()) };

    if !result.error_ptr.is_null() {
        let error = unsafe { *Box::from_raw(result.error_ptr as *mut String) };
        return Err(PluginError::config(format!("plugin '{plugin_path}' error: {error}")));
    }
    if result.plugin_ptr.is_null() {
        return Err(PluginError::config(format!("plugin '{plugin_path}' returned null")));
    }

    let inner: Box<T> = unsafe { *Box::from_raw(result.plugin_ptr as *mut Box<T>) };
    Ok((inner, lib))
}

macro_rules! define_plugin_wrapper {
    ($name:ident, $trait_ty:path, $symbol:literal) => {
        pub struct $name {
            inner: Option<Box<dyn $trait_ty>>,
            _lib: Library,
        }

        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl $name {
            pub fn load(plugin_path: &str, config_json: &str) -> Result<Self, PluginError> {
                let (inner, lib) = unsafe { load_plugin::<dyn $trait_ty>(plugin_path, $symbol, config_json)? };
                Ok(Self { inner: Some(inner), _lib: lib })
            }

            #[inline]
            fn get(&self) -> Result<&(dyn $trait_ty + '_), PluginError> {
                self.inner
                    .as_ref()
                    .map(|b| &**b)
                    .ok_or_else(|| PluginError::plugin(concat!(stringify!($name), " already dropped")))
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                // Drop the trait object while `_lib` (and its vtable) is still mapped.
                self.inner.take();
            }
        }
    };
}

define_plugin_wrapper!(PluginSouth, SouthPlugin, b"edge_create_south");
define_plugin_wrapper!(PluginNorth, NorthPlugin, b"edge_create_north");
define_plugin_wrapper!(PluginFilter, FilterPlugin, b"edge_create_filter");
define_plugin_wrapper!(PluginStorage, ReadingBuffer, b"edge_create_storage");

impl SouthPlugin for PluginSouth {
    fn info(&self) -> PluginInformation {
        self.get().map(|p| p.info()).unwrap_or_else(|e| panic!("{e}"))
    }

    fn reconfigure(&self, config_json: &str) -> Result<(), PluginError> {
        self.get()?.reconfigure(config_json)
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.shutdown(),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn poll(&self) -> Pin<Box<dyn Future<Output = Result<Option<Reading>, PluginError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.poll(),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn start(&self, sink: Arc<dyn ReadingSink>) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.start(sink),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

impl NorthPlugin for PluginNorth {
    fn info(&self) -> PluginInformation {
        self.get().map(|p| p.info()).unwrap_or_else(|e| panic!("{e}"))
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.start(),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn send(&self, readings: &[Reading]) -> Pin<Box<dyn Future<Output = Result<usize, PluginError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.send(readings),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }

    fn reconfigure(&self, config_json: &str) -> Result<(), PluginError> {
        self.get()?.reconfigure(config_json)
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.shutdown(),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

impl FilterPlugin for PluginFilter {
    fn info(&self) -> PluginInformation {
        self.get().map(|p| p.info()).unwrap_or_else(|e| panic!("{e}"))
    }

    fn init(&self, config_json: &str, emit: Emitter) -> Result<(), PluginError> {
        self.get()?.init(config_json, emit)
    }

    fn ingest(&self, set: ReadingSet) -> Result<(), PluginError> {
        self.get()?.ingest(set)
    }

    fn reconfigure(&self, config_json: &str) -> Result<(), PluginError> {
        self.get()?.reconfigure(config_json)
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        self.get()?.shutdown()
    }

    fn persists_state(&self) -> bool {
        self.get().map(|p| p.persists_state()).unwrap_or(false)
    }

    fn shutdown_save_data(&self) -> Option<String> {
        self.get().ok()?.shutdown_save_data()
    }

    fn restore_data(&self, data: &str) {
        if let Ok(inner) = self.get() {
            inner.restore_data(data)
        }
    }
}

impl ReadingBuffer for PluginStorage {
    fn append(&self, batch: Vec<Reading>) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.append(batch),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }

    fn fetch(
        &self,
        after_id: u64,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ReadingSet, StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.fetch(after_id, max_count),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }

    fn query(
        &self,
        predicate: QueryPredicate,
    ) -> Pin<Box<dyn Future<Output = Result<ReadingSet, StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.query(predicate),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }

    fn purge_by_age(
        &self,
        seconds: u64,
        retain_unsent: bool,
        last_sent: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PurgeResult, StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.purge_by_age(seconds, retain_unsent, last_sent),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }

    fn purge_by_rows(
        &self,
        target_rows: u64,
        retain_unsent: bool,
        last_sent: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PurgeResult, StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.purge_by_rows(target_rows, retain_unsent, last_sent),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }

    fn purge_by_asset(&self, asset: &str) -> Pin<Box<dyn Future<Output = Result<u64, StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.purge_by_asset(asset),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }

    fn stream_append(
        &self,
        batch: Vec<Reading>,
        commit: bool,
    ) -> Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.stream_append(batch, commit),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }

    fn create_schema(
        &self,
        definition: SchemaDefinition,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        match self.get() {
            Ok(inner) => inner.create_schema(definition),
            Err(e) => Box::pin(async move { Err(StorageError::Connection(e.to_string())) }),
        }
    }
}
