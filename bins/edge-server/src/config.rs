use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "edge-server", about = "Edge data-acquisition and forwarding service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the service
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginDeclaration {
    pub plugin: String,
    #[serde(default)]
    pub config: Option<toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SouthDeclaration {
    pub plugin: String,
    #[serde(default)]
    pub config: Option<toml::Value>,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retry_period_s")]
    pub max_retry_period_s: u64,
}

fn default_threshold() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_retry_period_s() -> u64 {
    30
}

impl SouthDeclaration {
    pub fn ingest_config(&self) -> south_ingest::IngestConfig {
        south_ingest::IngestConfig {
            threshold: self.threshold,
            flush_interval: std::time::Duration::from_millis(self.flush_interval_ms),
            max_retry_period: std::time::Duration::from_secs(self.max_retry_period_s),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterDeclaration {
    pub category: String,
    pub plugin: String,
    #[serde(default)]
    pub config: Option<toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NorthDeclaration {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub config: Option<toml::Value>,
    pub loader: north_loader::NorthLoaderConfig,
    #[serde(default)]
    pub filters: Vec<FilterDeclaration>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    pub south: SouthDeclaration,
    #[serde(default)]
    pub storage: Option<PluginDeclaration>,
    #[serde(default)]
    pub filters: Vec<FilterDeclaration>,
    #[serde(default)]
    pub north: Vec<NorthDeclaration>,
    #[serde(default = "default_true")]
    pub stream_enabled: bool,
}

fn default_service_name() -> String {
    "edge".to_string()
}
fn default_true() -> bool {
    true
}

impl ServiceConfig {
    pub fn load(path: &str) -> Result<Self, crate::error::ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        toml::from_str(&content)
            .map_err(|e| crate::error::ServerError::Config { context: "parse", detail: format!("'{path}': {e}") })
    }
}

pub fn config_json_or_empty(config: &Option<toml::Value>) -> Result<String, crate::error::ServerError> {
    match config {
        Some(v) => Ok(serde_json::to_string(v)?),
        None => Ok("{}".to_string()),
    }
}
