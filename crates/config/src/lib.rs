//! Configuration loading, validation, and management for askdb.
//!
//! Loads configuration from `~/.askdb/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.askdb/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Domain store connection
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Reasoning engine settings
    #[serde(default)]
    pub reasoner: ReasonerConfig,

    /// Prompt character budget
    #[serde(default)]
    pub budget: BudgetConfig,

    /// HTTP gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default)]
    pub name: String,

    /// Schema the bot is allowed to read
    #[serde(default = "default_db_schema")]
    pub schema: String,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Reference tables loaded for every resolution, in this order
    #[serde(default)]
    pub static_tables: Vec<String>,
}

fn default_db_host() -> String {
    "localhost".into()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_schema() -> String {
    "public".into()
}
fn default_db_user() -> String {
    "bot".into()
}
fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: String::new(),
            schema: default_db_schema(),
            user: default_db_user(),
            password: None,
            max_connections: default_max_connections(),
            static_tables: vec![],
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .field("max_connections", &self.max_connections)
            .field("static_tables", &self.static_tables)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ReasonerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Existing session assistant to reuse; created when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,

    /// Existing attached-context store to reuse; created when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_store_id: Option<String>,

    /// Language the answers are written in
    #[serde(default = "default_language")]
    pub language: String,

    /// Maximum generation calls in flight across the process
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4.1-mini-2025-04-14".into()
}
fn default_language() -> String {
    "Spanish".into()
}
fn default_concurrency_limit() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_run_timeout_secs() -> u64 {
    120
}
fn default_backoff_base_ms() -> u64 {
    1000
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            assistant_id: None,
            vector_store_id: None,
            language: default_language(),
            concurrency_limit: default_concurrency_limit(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl std::fmt::Debug for ReasonerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasonerConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("assistant_id", &self.assistant_id)
            .field("vector_store_id", &self.vector_store_id)
            .field("language", &self.language)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("max_attempts", &self.max_attempts)
            .field("timeout_secs", &self.timeout_secs)
            .field("run_timeout_secs", &self.run_timeout_secs)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total characters one prompt may carry, history included
    #[serde(default = "default_max_total_chars")]
    pub max_total_chars: usize,
}

fn default_max_total_chars() -> usize {
    800_000
}

/// Room kept for the fixed instruction text of each prompt.
const INSTRUCTION_RESERVE: usize = 20_000;

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_chars: default_max_total_chars(),
        }
    }
}

impl BudgetConfig {
    /// Characters available for inlined data fragments in one reasoning call.
    pub fn data_budget(&self) -> usize {
        (self.max_total_chars / 2).saturating_sub(INSTRUCTION_RESERVE)
    }

    /// Target length of an answer, passed to the engine as guidance.
    pub fn answer_limit(&self) -> usize {
        (self.max_total_chars / 2 / 20).saturating_sub(2_000)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Shared key expected in `X-Internal-API-Key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_api_key: Option<String>,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "localhost".into()
}
fn default_requests_per_minute() -> u32 {
    20
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            internal_api_key: None,
            requests_per_minute: default_requests_per_minute(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("internal_api_key", &redact(&self.internal_api_key))
            .field("requests_per_minute", &self.requests_per_minute)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.askdb/config.toml).
    ///
    /// Environment variables override file values:
    /// - `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_SCHEMA`, `DB_BOT_PASSWORD`
    /// - `STATIC_TABLES` (comma separated)
    /// - `OPENAI_API_KEY`, `ASKDB_MODEL`, `ASSISTANT_ID`, `VECTOR_STORE_ID`
    /// - `ASKDB_MAX_TOTAL_CHARS`
    /// - `INTERNAL_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Load from `path` when given, otherwise from the default location.
    pub fn load_with(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_dir().join("config.toml"),
        };
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = var("DB_HOST") {
            self.database.host = host;
        }
        if let Some(port) = var("DB_PORT") {
            self.database.port = parse_env("DB_PORT", &port)?;
        }
        if let Some(name) = var("DB_NAME") {
            self.database.name = name;
        }
        if let Some(schema) = var("DB_SCHEMA") {
            self.database.schema = schema;
        }
        if let Some(password) = var("DB_BOT_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Some(tables) = var("STATIC_TABLES") {
            self.database.static_tables = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(key) = var("OPENAI_API_KEY") {
            self.reasoner.api_key = Some(key);
        }
        if let Some(model) = var("ASKDB_MODEL") {
            self.reasoner.model = model;
        }
        if let Some(id) = var("ASSISTANT_ID") {
            self.reasoner.assistant_id = Some(id);
        }
        if let Some(id) = var("VECTOR_STORE_ID") {
            self.reasoner.vector_store_id = Some(id);
        }

        if let Some(total) = var("ASKDB_MAX_TOTAL_CHARS") {
            self.budget.max_total_chars = parse_env("ASKDB_MAX_TOTAL_CHARS", &total)?;
        }

        if let Some(key) = var("INTERNAL_API_KEY") {
            self.gateway.internal_api_key = Some(key);
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".askdb")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reasoner.concurrency_limit == 0 {
            return Err(ConfigError::ValidationError(
                "reasoner.concurrency_limit must be > 0".into(),
            ));
        }

        if self.reasoner.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "reasoner.max_attempts must be > 0".into(),
            ));
        }

        if self.budget.data_budget() == 0 {
            return Err(ConfigError::ValidationError(format!(
                "budget.max_total_chars must exceed {} to leave room for data",
                INSTRUCTION_RESERVE * 2
            )));
        }

        if self.gateway.requests_per_minute == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.requests_per_minute must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if a reasoning API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.reasoner.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} has an invalid value: {value}")))
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
