//! TOML configuration. Every field has a default, and a missing file yields
//! the defaults.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connector::{
    ConnectionProfile, ConnectorSettings, ExecutionLimits, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_MAX_RESPONSE_BYTES,
    DEFAULT_MAX_ROWS, DEFAULT_POOL_SIZE,
};
use crate::prompt::{PromptBudget, DEFAULT_MAX_ERROR_CHARS, DEFAULT_MAX_SCHEMA_CHARS};
use crate::schema::{SchemaCache, SchemaStore, DEFAULT_TTL};
use crate::synth::{
    ModelEndpoint, ModelProvider, SafetyMode, SynthesizerConfig, DEFAULT_BACKOFF, DEFAULT_MAX_TOKENS,
    DEFAULT_MODEL_RETRIES, DEFAULT_MODEL_TIMEOUT,
};

pub const DEFAULT_SYNTAX_RETRY_BUDGET: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub model: ModelConfig,
    pub execution: ExecutionConfig,
    pub prompt: PromptConfig,
    pub safety: SafetyConfig,
    pub profiles: Vec<ConnectionProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Persist schemas here; in-memory only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL.as_secs(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    /// Provider default when unset.
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::default(),
            model: None,
            base_url: None,
            api_key_env: None,
            temperature: 0.0,
            max_tokens: DEFAULT_MAX_TOKENS,
            seed: None,
            timeout_secs: DEFAULT_MODEL_TIMEOUT.as_secs(),
            max_retries: DEFAULT_MODEL_RETRIES,
            backoff_ms: DEFAULT_BACKOFF.as_millis() as u64,
        }
    }
}

impl ModelConfig {
    /// Resolve provider defaults and read the API key from the environment.
    pub fn endpoint(&self) -> ModelEndpoint {
        let key_env = self
            .api_key_env
            .clone()
            .unwrap_or_else(|| self.provider.default_api_key_env().to_string());
        ModelEndpoint {
            provider: self.provider,
            model: self
                .model
                .clone()
                .unwrap_or_else(|| self.provider.default_model().to_string()),
            base_url: self
                .base_url
                .clone()
                .unwrap_or_else(|| self.provider.default_base_url().to_string()),
            api_key: std::env::var(&key_env).ok(),
        }
    }

    pub fn synthesizer(&self) -> SynthesizerConfig {
        SynthesizerConfig {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            seed: self.seed,
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_rows: usize,
    pub timeout_secs: u64,
    /// Corrected attempts after the backend rejects a candidate's syntax.
    pub syntax_retry_budget: u32,
    pub pool_size: usize,
    pub max_response_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            timeout_secs: DEFAULT_EXECUTION_TIMEOUT.as_secs(),
            syntax_retry_budget: DEFAULT_SYNTAX_RETRY_BUDGET,
            pool_size: DEFAULT_POOL_SIZE,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

impl ExecutionConfig {
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_rows: self.max_rows,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            pool_size: self.pool_size.max(1),
            timeout: Duration::from_secs(self.timeout_secs),
            max_response_bytes: self.max_response_bytes.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub max_schema_chars: usize,
    pub max_error_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_schema_chars: DEFAULT_MAX_SCHEMA_CHARS,
            max_error_chars: DEFAULT_MAX_ERROR_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub mode: SafetyMode,
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nlquery")
            .join("config.toml")
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn prompt_budget(&self) -> PromptBudget {
        PromptBudget {
            max_schema_chars: self.prompt.max_schema_chars,
            max_error_chars: self.prompt.max_error_chars,
            max_rows: self.execution.max_rows,
        }
    }

    pub fn schema_cache(&self) -> SchemaCache {
        let builder = SchemaCache::builder().ttl(Duration::from_secs(self.cache.ttl_secs));
        match &self.cache.directory {
            Some(dir) => builder.store(SchemaStore::new(dir)).build(),
            None => builder.build(),
        }
    }

    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.execution.max_rows, 1000);
        assert_eq!(config.execution.syntax_retry_budget, 1);
        assert_eq!(config.model.provider, ModelProvider::OpenAi);
        assert_eq!(config.model.temperature, 0.0);
        assert_eq!(config.safety.mode, SafetyMode::Gate);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.prompt.max_schema_chars, 12_000);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [cache]
            ttl_secs = 600
            directory = "/tmp/nlquery-schemas"

            [model]
            provider = "anthropic"
            seed = 7
            max_retries = 4

            [execution]
            max_rows = 50
            syntax_retry_budget = 2

            [safety]
            mode = "advisory"

            [[profiles]]
            name = "shop"
            backend = "postgres"
            address = "db.internal:5432"
            database = "shop"
            credentials = { username = "reader", secret_env = "SHOP_PASSWORD" }
            options = { sslmode = "require" }

            [[profiles]]
            name = "graph"
            backend = "neo4j"
            address = "http://neo4j.internal:7474"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl_secs, 600);
        assert_eq!(config.model.provider, ModelProvider::Anthropic);
        assert_eq!(config.model.synthesizer().max_retries, 4);
        assert_eq!(config.model.synthesizer().seed, Some(7));
        assert_eq!(config.model.endpoint().model, "claude-3-5-haiku-latest");
        assert_eq!(config.prompt_budget().max_rows, 50);
        assert_eq!(config.execution.syntax_retry_budget, 2);
        assert_eq!(config.safety.mode, SafetyMode::Advisory);

        let shop = config.profile("shop").unwrap();
        assert_eq!(shop.backend, Backend::Postgres);
        assert_eq!(shop.option("sslmode"), Some("require"));
        assert_eq!(shop.credentials.username.as_deref(), Some("reader"));
        assert_eq!(config.profile("graph").unwrap().backend, Backend::Neo4j);
        assert!(config.profile("missing").is_none());
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        assert!(Config::parse("[execution]\nmax_rows = \"many\"").is_err());
        assert!(Config::parse("[[profiles]]\nname = \"x\"\nbackend = \"oracle\"\naddress = \"h\"").is_err());
    }
}
