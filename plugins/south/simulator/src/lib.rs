//! Minimal poll-mode south plugin: emits one synthetic sine-ish reading
//! per `poll()` call. Exists to exercise the south ABI end-to-end, not to
//! model a real device.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use edge_api::error::PluginError;
use edge_api::ffi::{parse_plugin_config_opt, plugin_err, plugin_ok, PluginCreateResult, PluginInformation, PluginKind};
use edge_api::plugins::{ReadingSink, SouthPlugin};
use edge_api::reading::{DatapointValue, Reading};
use edge_api::{edge_abi_version_fn, edge_destroy_fn};

#[derive(Debug, serde::Deserialize)]
struct SimulatorConfig {
    #[serde(default = "default_asset")]
    asset: String,
    #[serde(default = "default_amplitude")]
    amplitude: f64,
}

fn default_asset() -> String {
    "simulator".to_string()
}
fn default_amplitude() -> f64 {
    10.0
}

pub struct SimulatorPlugin {
    asset: String,
    amplitude: f64,
    tick: AtomicU64,
}

impl SimulatorPlugin {
    fn new(config: SimulatorConfig) -> Self {
        Self { asset: config.asset, amplitude: config.amplitude, tick: AtomicU64::new(0) }
    }
}

impl SouthPlugin for SimulatorPlugin {
    fn info(&self) -> PluginInformation {
        PluginInformation {
            name: "south-simulator".to_string(),
            version: "0.1.0".to_string(),
            kind: PluginKind::South,
            interface_version: "2.0.0".to_string(),
            flags: 0,
            config_default_json: serde_json::json!({"asset": "simulator", "amplitude": 10.0}),
        }
    }

    fn reconfigure(&self, _config_json: &str) -> Result<(), PluginError> {
        Ok(())
    }

    fn shutdown(&self) -> Pin<Box<dyn std::future::Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn poll(&self) -> Pin<Box<dyn std::future::Future<Output = Result<Option<Reading>, PluginError>> + Send + '_>> {
        Box::pin(async move {
            let n = self.tick.fetch_add(1, Ordering::Relaxed) as f64;
            let value = self.amplitude * (n * 0.1).sin();
            Ok(Some(Reading {
                asset: self.asset.clone(),
                user_ts: chrono::Utc::now(),
                system_ts: chrono::Utc::now(),
                id: None,
                uuid: None,
                datapoints: vec![("value".to_string(), DatapointValue::Float(value))],
            }))
        })
    }

    fn start(&self, _sink: Arc<dyn ReadingSink>) -> Pin<Box<dyn std::future::Future<Output = Result<(), PluginError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// # Safety
/// `config_json_ptr` must point to `config_json_len` valid UTF-8 bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_create_south(config_json_ptr: *const u8, config_json_len: usize) -> PluginCreateResult {
    let config: SimulatorConfig = match unsafe { parse_plugin_config_opt(config_json_ptr, config_json_len) } {
        Ok(c) => c,
        Err(e) => return plugin_err(e.to_string()),
    };
    plugin_ok(Box::new(SimulatorPlugin::new(config)) as Box<dyn SouthPlugin>)
}

edge_destroy_fn!(edge_destroy_south, SouthPlugin);
edge_abi_version_fn!();

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_always_returns_a_reading() {
        let plugin = SimulatorPlugin::new(SimulatorConfig { asset: "a".into(), amplitude: 5.0 });
        let reading = plugin.poll().await.unwrap().unwrap();
        assert_eq!(reading.asset, "a");
        assert_eq!(reading.datapoints.len(), 1);
    }
}
