use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub wal_flush_interval_ms: u64,
    pub connection_pool_size: u32,
    pub pool_acquire_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 120,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingProviderConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub call_timeout_ms: u64,
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmProviderConfig {
    pub provider: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature_max: f32,
    pub top_p_max: f32,
    pub call_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankProviderConfig {
    pub provider: String,
    pub model: String,
    pub call_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SparseStoreConfig {
    /// "memory" | "external"
    pub backend: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    pub admin_token_hash: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub embedding: EmbeddingProviderConfig,
    pub llm: LlmProviderConfig,
    pub rerank: Option<RerankProviderConfig>,
    pub sparse_store: SparseStoreConfig,
    pub admin: AdminConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("KB").separator("__"));

        builder.build()?.try_deserialize()
    }
}
