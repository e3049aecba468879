#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("no {0} configured")]
    NoComponents(&'static str),

    #[error("plugin: {0}")]
    Plugin(#[from] edge_api::error::PluginError),

    #[error("storage: {0}")]
    Storage(#[from] edge_api::storage::StorageError),

    #[error("filter pipeline: {0}")]
    FilterPipeline(#[from] filter_pipeline::FilterPipelineError),

    #[error("north loader: {0}")]
    NorthLoader(#[from] north_loader::NorthLoaderError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialization: {0}")]
    Json(#[from] serde_json::Error),
}
