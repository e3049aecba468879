//! Ordered filter chain (C3).
//!
//! Each filter's `init` is handed an [`Emitter`] that forwards to the next
//! filter's `ingest` — the last filter's emitter is the pipeline's terminal
//! sink. Reconfiguration is all-or-nothing: a descriptor list whose filter
//! names are unchanged hot-reloads each filter in place; any other change
//! rebuilds the whole chain under a fresh set of plugin loads and only
//! swaps it in once every filter has initialized successfully.

use std::sync::Arc;

use edge_api::error::PluginError;
use edge_api::plugins::Emitter;
use edge_api::plugins::FilterPlugin;
use edge_api::reading::ReadingSet;
use plugin_host::PluginFilter;

#[derive(Debug, thiserror::Error)]
pub enum FilterPipelineError {
    #[error("filter '{category}' ({plugin}): {source}")]
    Load { category: String, plugin: String, source: PluginError },
    #[error("filter '{category}' init: {source}")]
    Init { category: String, source: PluginError },
    #[error("filter '{category}' reconfigure: {source}")]
    Reconfigure { category: String, source: PluginError },
    #[error("config serialization: {0}")]
    ConfigSerialization(#[from] serde_json::Error),
}

/// One entry in the service's declared filter chain.
#[derive(Debug, Clone)]
pub struct FilterDescriptor {
    /// The filter's configuration category name — also the persisted-state
    /// key suffix (`"{service}-{category}"`).
    pub category: String,
    pub plugin: String,
    pub config: Option<toml::Value>,
}

fn config_json_or_empty(config: &Option<toml::Value>) -> Result<String, FilterPipelineError> {
    match config {
        Some(v) => Ok(serde_json::to_string(v)?),
        None => Ok("{}".to_string()),
    }
}

/// Persists/recalls filter state across restarts; a real deployment backs
/// this with the storage engine's key-value table, out of scope here (§1).
pub trait FilterStateStore: Send + Sync {
    fn load(&self, key: &str) -> Option<String>;
    fn save(&self, key: &str, data: String);
}

struct FilterSlot {
    category: String,
    filter: Arc<PluginFilter>,
}

pub struct FilterPipeline {
    service_name: String,
    descriptors: Vec<FilterDescriptor>,
    slots: Vec<FilterSlot>,
    head: Emitter,
}

impl FilterPipeline {
    /// Build a chain from scratch, wiring each filter's emitter to the next
    /// filter's `ingest` (last filter's emitter is `terminal`).
    pub fn build(
        service_name: &str,
        descriptors: &[FilterDescriptor],
        terminal: Emitter,
        state: &dyn FilterStateStore,
    ) -> Result<Self, FilterPipelineError> {
        let mut slots_rev = Vec::with_capacity(descriptors.len());
        let mut next_emitter = terminal.clone();

        for desc in descriptors.iter().rev() {
            let config_json = config_json_or_empty(&desc.config)?;
            let filter = PluginFilter::load(&desc.plugin, &config_json).map_err(|e| FilterPipelineError::Load {
                category: desc.category.clone(),
                plugin: desc.plugin.clone(),
                source: e,
            })?;
            filter
                .init(&config_json, next_emitter.clone())
                .map_err(|e| FilterPipelineError::Init { category: desc.category.clone(), source: e })?;

            let state_key = format!("{service_name}-{}", desc.category);
            if filter.persists_state() {
                if let Some(saved) = state.load(&state_key) {
                    filter.restore_data(&saved);
                }
            }

            let filter = Arc::new(filter);
            let downstream = filter.clone();
            let category = desc.category.clone();
            next_emitter = Arc::new(move |set: ReadingSet| {
                if let Err(e) = downstream.ingest(set) {
                    tracing::error!(filter = %category, error = ?e, "filter ingest error, batch dropped");
                }
            });
            slots_rev.push(FilterSlot { category: desc.category.clone(), filter });
        }

        slots_rev.reverse();
        let head = if slots_rev.is_empty() { terminal } else { next_emitter };

        Ok(Self { service_name: service_name.to_string(), descriptors: descriptors.to_vec(), slots: slots_rev, head })
    }

    pub fn ingest(&self, set: ReadingSet) {
        (self.head)(set)
    }

    /// All-or-nothing reconfigure. Unchanged filter *names* (in the same
    /// order) hot-reload in place; anything else rebuilds the whole chain
    /// and only swaps it in on full success — the old chain keeps running
    /// untouched if any new filter fails to load or init.
    pub fn reconfigure(
        &mut self,
        new_descriptors: &[FilterDescriptor],
        terminal: Emitter,
        state: &dyn FilterStateStore,
    ) -> Result<(), FilterPipelineError> {
        let same_shape = self.descriptors.len() == new_descriptors.len()
            && self
                .descriptors
                .iter()
                .zip(new_descriptors)
                .all(|(old, new)| old.category == new.category && old.plugin == new.plugin);

        if same_shape {
            for (slot, new) in self.slots.iter().zip(new_descriptors) {
                let config_json = config_json_or_empty(&new.config)?;
                slot.filter
                    .reconfigure(&config_json)
                    .map_err(|e| FilterPipelineError::Reconfigure { category: slot.category.clone(), source: e })?;
            }
            self.descriptors = new_descriptors.to_vec();
            tracing::info!(service = %self.service_name, "filter pipeline hot-reconfigured");
            return Ok(());
        }

        let rebuilt = Self::build(&self.service_name, new_descriptors, terminal, state)?;
        tracing::info!(service = %self.service_name, "filter pipeline rebuilt");
        *self = rebuilt;
        Ok(())
    }

    pub fn shutdown(&self, state: &dyn FilterStateStore) {
        for slot in &self.slots {
            if slot.filter.persists_state() {
                if let Some(data) = slot.filter.shutdown_save_data() {
                    state.save(&format!("{}-{}", self.service_name, slot.category), data);
                }
            }
            if let Err(e) = slot.filter.shutdown() {
                tracing::error!(filter = %slot.category, error = ?e, "filter shutdown error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct NoopStore;
    impl FilterStateStore for NoopStore {
        fn load(&self, _key: &str) -> Option<String> {
            None
        }
        fn save(&self, _key: &str, _data: String) {}
    }

    #[test]
    fn empty_pipeline_forwards_straight_to_terminal() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let terminal: Emitter = Arc::new(move |set: ReadingSet| received2.lock().unwrap().push(set));

        let pipeline = FilterPipeline::build("svc", &[], terminal, &NoopStore).unwrap();
        pipeline.ingest(ReadingSet::new(vec![]));

        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
