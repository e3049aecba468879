//! North plugin adapter over the OMF transmit engine (C8), loaded by
//! `plugin-host` like any other `.so` north plugin.

use std::pin::Pin;
use std::sync::Arc;

use edge_api::error::PluginError;
use edge_api::ffi::{parse_plugin_config, plugin_err, plugin_ok, PluginCreateResult, PluginInformation, PluginKind};
use edge_api::plugins::NorthPlugin;
use edge_api::reading::Reading;
use edge_api::{edge_abi_version_fn, edge_destroy_fn};
use omf::{OmfEngine, OmfEngineConfig, SendOutcome};
use tokio::sync::RwLock;

pub struct OmfNorthPlugin {
    engine: RwLock<Arc<OmfEngine>>,
}

impl OmfNorthPlugin {
    fn new(config: OmfEngineConfig) -> Result<Self, PluginError> {
        let engine = OmfEngine::new(config).map_err(|e| PluginError::config(e.to_string()))?;
        Ok(Self { engine: RwLock::new(Arc::new(engine)) })
    }
}

impl NorthPlugin for OmfNorthPlugin {
    fn info(&self) -> PluginInformation {
        PluginInformation {
            name: "north-omf".to_string(),
            version: "0.1.0".to_string(),
            kind: PluginKind::North,
            interface_version: "2.0.0".to_string(),
            flags: 0,
            config_default_json: serde_json::json!({}),
        }
    }

    fn start(&self) -> Pin<Box<dyn std::future::Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn send(&self, readings: &[Reading]) -> Pin<Box<dyn std::future::Future<Output = Result<usize, PluginError>> + Send + '_>> {
        let readings = readings.to_vec();
        Box::pin(async move {
            let engine = self.engine.read().await.clone();
            match engine.send(&readings).await {
                Ok(SendOutcome::Sent(n)) => Ok(n),
                Ok(SendOutcome::Failed { unsent }) => {
                    Err(PluginError::transport(format!("OMF send failed for {unsent} readings")))
                }
                Err(e) => Err(PluginError::transport(e.to_string())),
            }
        })
    }

    fn reconfigure(&self, config_json: &str) -> Result<(), PluginError> {
        let config: OmfEngineConfig =
            serde_json::from_str(config_json).map_err(|e| PluginError::config(format!("invalid OMF config: {e}")))?;
        let engine = OmfEngine::new(config).map_err(|e| PluginError::config(e.to_string()))?;
        // Parameter changes here are Postmaster-class (new producer token,
        // endpoint, naming scheme): the type cache is intentionally not
        // carried over, since a naming-scheme change invalidates it anyway.
        *self.engine.try_write().map_err(|_| PluginError::plugin("OMF reconfigure: engine busy"))? = Arc::new(engine);
        Ok(())
    }

    fn shutdown(&self) -> Pin<Box<dyn std::future::Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// # Safety
/// `config_json_ptr` must point to `config_json_len` valid UTF-8 bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_create_north(config_json_ptr: *const u8, config_json_len: usize) -> PluginCreateResult {
    let config: OmfEngineConfig = match unsafe { parse_plugin_config(config_json_ptr, config_json_len) } {
        Ok(c) => c,
        Err(e) => return plugin_err(e.to_string()),
    };
    match OmfNorthPlugin::new(config) {
        Ok(plugin) => plugin_ok(Box::new(plugin) as Box<dyn NorthPlugin>),
        Err(e) => plugin_err(e.to_string()),
    }
}

edge_destroy_fn!(edge_destroy_north, NorthPlugin);
edge_abi_version_fn!();
