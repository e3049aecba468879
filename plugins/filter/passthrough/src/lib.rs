//! Passthrough filter: forwards every reading set to the next stage
//! unchanged. Exists to exercise the filter ABI end-to-end and as the
//! default "no-op" entry in a declared filter chain.

use std::sync::Mutex;

use edge_api::error::PluginError;
use edge_api::ffi::{parse_plugin_config, plugin_err, plugin_ok, PluginCreateResult, PluginInformation, PluginKind};
use edge_api::plugins::{Emitter, FilterPlugin};
use edge_api::reading::ReadingSet;
use edge_api::{edge_abi_version_fn, edge_destroy_fn};

#[derive(Debug, Default, serde::Deserialize)]
struct PassthroughConfig {}

pub struct PassthroughFilter {
    emit: Mutex<Option<Emitter>>,
}

impl PassthroughFilter {
    fn new(_config: PassthroughConfig) -> Self {
        Self { emit: Mutex::new(None) }
    }
}

impl FilterPlugin for PassthroughFilter {
    fn info(&self) -> PluginInformation {
        PluginInformation {
            name: "filter-passthrough".to_string(),
            version: "0.1.0".to_string(),
            kind: PluginKind::Filter,
            interface_version: "2.0.0".to_string(),
            flags: 0,
            config_default_json: serde_json::json!({}),
        }
    }

    fn init(&self, _config_json: &str, emit: Emitter) -> Result<(), PluginError> {
        *self.emit.lock().unwrap() = Some(emit);
        Ok(())
    }

    fn ingest(&self, set: ReadingSet) -> Result<(), PluginError> {
        let emit = self.emit.lock().unwrap();
        match emit.as_ref() {
            Some(emit) => {
                emit(set);
                Ok(())
            }
            None => Err(PluginError::plugin("passthrough filter ingest before init")),
        }
    }

    fn reconfigure(&self, _config_json: &str) -> Result<(), PluginError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// # Safety
/// `config_json_ptr` must point to `config_json_len` valid UTF-8 bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn edge_create_filter(config_json_ptr: *const u8, config_json_len: usize) -> PluginCreateResult {
    let config: PassthroughConfig = match unsafe { parse_plugin_config(config_json_ptr, config_json_len) } {
        Ok(c) => c,
        Err(e) => return plugin_err(e.to_string()),
    };
    plugin_ok(Box::new(PassthroughFilter::new(config)) as Box<dyn FilterPlugin>)
}

edge_destroy_fn!(edge_destroy_filter, FilterPlugin);
edge_abi_version_fn!();

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn forwards_unchanged_set_to_emitter() {
        let filter = PassthroughFilter::new(PassthroughConfig::default());
        let received = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        let emit: Emitter = Arc::new(move |set: ReadingSet| *received2.lock().unwrap() = Some(set));
        filter.init("{}", emit).unwrap();

        filter.ingest(ReadingSet::new(vec![])).unwrap();
        assert!(received.lock().unwrap().is_some());
    }
}
