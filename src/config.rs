//! TOML configuration parsing, validation, and range clamping.
//!
//! ```toml
//! [indexing]
//! chunk_size = 1000
//! chunk_overlap = 200
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [sources.docs]
//! type = "file"
//! path = "./docs"
//! exclude_patterns = ["*/drafts/*"]
//!
//! [sources.tickets]
//! type = "api"
//! endpoint = "https://tickets.example.com/api/v1/issues"
//! pagination = { type = "offset", limit = 100 }
//! credentials = { bearer_token = "..." }
//! ```
//!
//! Required fields are checked per source type. Numeric settings that bound
//! resource usage are clamped into a safe range (with a warning) rather than
//! rejected.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::DataSourceError;
use crate::models::SourceType;
use crate::retry::RetryOptions;

/// Extensions the file connector knows how to parse.
pub const SUPPORTED_FILE_TYPES: &[&str] = &["pdf", "txt", "md", "docx", "doc"];

const MAX_FILE_BYTES_CEILING: u64 = 512 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_true")]
    pub enable_metadata_extraction: bool,
    #[serde(default = "default_indexing_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
    #[serde(default = "default_keyword_limit")]
    pub keyword_limit: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            enable_metadata_extraction: true,
            batch_size: default_indexing_batch_size(),
            concurrency: default_concurrency(),
            default_strategy: default_strategy(),
            keyword_limit: default_keyword_limit(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_max_chunk_size() -> usize {
    4000
}
fn default_true() -> bool {
    true
}
fn default_indexing_batch_size() -> usize {
    10
}
fn default_concurrency() -> usize {
    4
}
fn default_strategy() -> String {
    "sliding-window".to_string()
}
fn default_keyword_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            path: None,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_backend() -> String {
    "memory".to_string()
}
fn default_cache_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

/// One entry under `[sources.<id>]`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    /// Display name; defaults to the source id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(flatten)]
    pub settings: DataSourceConfig,
}

/// Type-specific settings, selected by the `type` key.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DataSourceConfig {
    File(FileSourceConfig),
    Database(DatabaseSourceConfig),
    Api(ApiSourceConfig),
}

impl DataSourceConfig {
    pub fn source_type(&self) -> SourceType {
        match self {
            DataSourceConfig::File(_) => SourceType::File,
            DataSourceConfig::Database(_) => SourceType::Database,
            DataSourceConfig::Api(_) => SourceType::Api,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Glob-like patterns (`*`, `?`) matched anywhere in the file path.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Restrict discovery to these extensions; empty means all supported.
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default)]
    pub watch_changes: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseSourceConfig {
    #[serde(skip_serializing)]
    pub connection_string: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_title_column")]
    pub title_column: String,
    #[serde(default = "default_content_column")]
    pub content_column: String,
    /// Monotonic column used as a high-water mark for incremental sync.
    #[serde(default)]
    pub incremental_column: Option<String>,
    /// Column holding the row's modification time, if any.
    #[serde(default)]
    pub updated_column: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_id_column() -> String {
    "id".to_string()
}
fn default_title_column() -> String {
    "title".to_string()
}
fn default_content_column() -> String {
    "content".to_string()
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiSourceConfig {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    #[serde(default, skip_serializing)]
    pub credentials: ApiCredentials,
    /// Explicit field holding the record array, probed before the defaults.
    #[serde(default)]
    pub records_field: Option<String>,
    /// Query parameter that receives the last sync time on incremental pulls.
    #[serde(default)]
    pub since_param: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,
}

fn default_method() -> String {
    "GET".to_string()
}
fn default_rate_limit() -> u32 {
    10
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaginationKind {
    Offset,
    Cursor,
    Page,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PaginationConfig {
    #[serde(rename = "type")]
    pub kind: PaginationKind,
    /// Page size requested from the server.
    #[serde(default = "default_page_limit")]
    pub limit: u64,
    #[serde(default = "default_limit_param")]
    pub limit_param: String,
    #[serde(default = "default_offset_param")]
    pub offset_param: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    /// Response field holding the next cursor; probed from defaults if unset.
    #[serde(default)]
    pub cursor_field: Option<String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
}

fn default_page_limit() -> u64 {
    100
}
fn default_limit_param() -> String {
    "limit".to_string()
}
fn default_offset_param() -> String {
    "offset".to_string()
}
fn default_cursor_param() -> String {
    "cursor".to_string()
}
fn default_page_param() -> String {
    "page".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiCredentials {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ApiCredentials {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_header: default_api_key_header(),
            bearer_token: None,
            username: None,
            password: None,
        }
    }
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// Load, validate, and clamp the configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}

impl Config {
    /// Check required fields and clamp numeric settings in place.
    pub fn validate(&mut self) -> Result<()> {
        self.indexing.clamp();

        if self.embedding.is_enabled() && self.embedding.provider != "local" {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
                other
            ),
        }
        clamp_field("embedding.batch_size", &mut self.embedding.batch_size, 1, 2048);
        clamp_field("embedding.timeout_secs", &mut self.embedding.timeout_secs, 1, 600);

        match self.cache.backend.as_str() {
            "memory" => {}
            "sqlite" => {
                if self.cache.path.is_none() {
                    anyhow::bail!("cache.path is required when cache.backend is 'sqlite'");
                }
            }
            other => anyhow::bail!(
                "Unknown cache backend: '{}'. Must be memory or sqlite.",
                other
            ),
        }

        for (id, source) in self.sources.iter_mut() {
            source
                .validate(id)
                .with_context(|| format!("Invalid configuration for source '{}'", id))?;
        }

        Ok(())
    }
}

impl IndexingConfig {
    pub fn clamp(&mut self) {
        clamp_field("indexing.max_chunk_size", &mut self.max_chunk_size, 1, 100_000);
        clamp_field("indexing.chunk_size", &mut self.chunk_size, 1, self.max_chunk_size);
        clamp_field("indexing.min_chunk_size", &mut self.min_chunk_size, 0, self.chunk_size);
        clamp_field(
            "indexing.chunk_overlap",
            &mut self.chunk_overlap,
            0,
            self.chunk_size - 1,
        );
        clamp_field("indexing.batch_size", &mut self.batch_size, 1, 1000);
        clamp_field("indexing.concurrency", &mut self.concurrency, 1, 64);
        clamp_field("indexing.keyword_limit", &mut self.keyword_limit, 1, 100);
    }
}

impl SourceConfig {
    pub fn display_name(&self, id: &str) -> String {
        self.name.clone().unwrap_or_else(|| id.to_string())
    }

    /// Enforce the per-type required fields and clamp bounded settings.
    pub fn validate(&mut self, id: &str) -> Result<(), DataSourceError> {
        clamp_field("timeout_secs", &mut self.timeout_secs, 1, 600);
        self.retry.clamp();

        match &mut self.settings {
            DataSourceConfig::File(cfg) => {
                if cfg.path.as_os_str().is_empty() {
                    return Err(DataSourceError::validation(id, "file source requires a path"));
                }
                for ft in cfg.file_types.iter_mut() {
                    *ft = ft.trim_start_matches('.').to_lowercase();
                    if !SUPPORTED_FILE_TYPES.contains(&ft.as_str()) {
                        return Err(DataSourceError::validation(
                            id,
                            format!(
                                "unsupported file type '{}'; supported: {}",
                                ft,
                                SUPPORTED_FILE_TYPES.join(", ")
                            ),
                        ));
                    }
                }
                clamp_field("max_file_bytes", &mut cfg.max_file_bytes, 1, MAX_FILE_BYTES_CEILING);
            }
            DataSourceConfig::Database(cfg) => {
                if cfg.connection_string.trim().is_empty() {
                    return Err(DataSourceError::validation(
                        id,
                        "database source requires a connection_string",
                    ));
                }
                let has_query = cfg.query.as_deref().is_some_and(|q| !q.trim().is_empty());
                let has_table = cfg.table.as_deref().is_some_and(|t| !t.trim().is_empty());
                if has_query == has_table {
                    return Err(DataSourceError::validation(
                        id,
                        "database source requires exactly one of query or table",
                    ));
                }
                if !cfg.connection_string.starts_with("sqlite:") {
                    let user_ok = cfg.username.as_deref().is_some_and(|u| !u.is_empty());
                    let pass_ok = cfg.password.as_deref().is_some_and(|p| !p.is_empty());
                    if !user_ok || !pass_ok {
                        return Err(DataSourceError::validation(
                            id,
                            "database source requires username and password",
                        ));
                    }
                }
                clamp_field("max_connections", &mut cfg.max_connections, 1, 32);
            }
            DataSourceConfig::Api(cfg) => {
                if cfg.endpoint.trim().is_empty() {
                    return Err(DataSourceError::validation(id, "api source requires an endpoint"));
                }
                let url = reqwest::Url::parse(&cfg.endpoint).map_err(|e| {
                    DataSourceError::validation(id, format!("invalid endpoint URL: {}", e))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(DataSourceError::validation(
                        id,
                        format!("endpoint must be http or https, got '{}'", url.scheme()),
                    ));
                }
                cfg.method = cfg.method.to_uppercase();
                if cfg.method != "GET" && cfg.method != "POST" {
                    return Err(DataSourceError::validation(
                        id,
                        format!("unsupported HTTP method '{}'", cfg.method),
                    ));
                }
                clamp_field(
                    "rate_limit_per_second",
                    &mut cfg.rate_limit_per_second,
                    1,
                    1000,
                );
                if let Some(p) = cfg.pagination.as_mut() {
                    clamp_field("pagination.limit", &mut p.limit, 1, 10_000);
                }
            }
        }
        Ok(())
    }
}

/// Clamp `value` into `[min, max]`, warning when it had to move.
pub(crate) fn clamp_field<T>(name: &str, value: &mut T, min: T, max: T)
where
    T: PartialOrd + Copy + Display,
{
    let clamped = if *value < min {
        min
    } else if *value > max {
        max
    } else {
        *value
    };
    if clamped != *value {
        tracing::warn!(field = name, from = %value, to = %clamped, "clamped configuration value");
        *value = clamped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_defaults_apply_to_empty_config() {
        let mut config = parse("");
        config.validate().unwrap();
        assert_eq!(config.indexing.chunk_size, 1000);
        assert_eq!(config.indexing.chunk_overlap, 200);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.cache.backend, "memory");
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_parses_tagged_sources() {
        let mut config = parse(
            r#"
[sources.docs]
type = "file"
path = "./docs"
file_types = [".MD", "txt"]

[sources.tickets]
type = "api"
name = "Ticket API"
endpoint = "https://example.com/api/issues"
pagination = { type = "cursor", limit = 50, cursor_field = "next" }
credentials = { bearer_token = "abc" }

[sources.warehouse]
type = "database"
connection_string = "postgres://db.internal/warehouse"
table = "articles"
username = "reader"
password = "secret"
incremental_column = "id"
"#,
        );
        config.validate().unwrap();

        let docs = &config.sources["docs"];
        match &docs.settings {
            DataSourceConfig::File(f) => {
                assert!(f.recursive);
                assert_eq!(f.file_types, vec!["md", "txt"]);
            }
            other => panic!("expected file config, got {:?}", other),
        }

        let tickets = &config.sources["tickets"];
        assert_eq!(tickets.display_name("tickets"), "Ticket API");
        match &tickets.settings {
            DataSourceConfig::Api(a) => {
                let p = a.pagination.as_ref().unwrap();
                assert_eq!(p.kind, PaginationKind::Cursor);
                assert_eq!(p.limit, 50);
                assert_eq!(a.credentials.bearer_token.as_deref(), Some("abc"));
                assert_eq!(a.credentials.api_key_header, "X-API-Key");
            }
            other => panic!("expected api config, got {:?}", other),
        }

        assert_eq!(
            config.sources["warehouse"].settings.source_type(),
            SourceType::Database
        );
    }

    #[test]
    fn test_clamps_out_of_range_values() {
        let mut config = parse(
            r#"
[indexing]
chunk_size = 500
chunk_overlap = 900
batch_size = 0

[sources.api]
type = "api"
endpoint = "http://localhost:9000/items"
timeout_secs = 100000
rate_limit_per_second = 0
"#,
        );
        config.validate().unwrap();
        assert_eq!(config.indexing.chunk_overlap, 499);
        assert_eq!(config.indexing.batch_size, 1);
        let api = &config.sources["api"];
        assert_eq!(api.timeout_secs, 600);
        match &api.settings {
            DataSourceConfig::Api(a) => assert_eq!(a.rate_limit_per_second, 1),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_rejects_missing_required_fields() {
        let mut config = parse(
            r#"
[sources.db]
type = "database"
connection_string = "mysql://db/app"
query = "SELECT * FROM posts"
"#,
        );
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("username and password"));

        let mut config = parse(
            r#"
[sources.db]
type = "database"
connection_string = "sqlite://app.db"
query = "SELECT * FROM posts"
table = "posts"
"#,
        );
        assert!(config.validate().is_err());

        let mut config = parse(
            r#"
[sources.api]
type = "api"
endpoint = "ftp://example.com/feed"
"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unsupported_file_type() {
        let mut config = parse(
            r#"
[sources.docs]
type = "file"
path = "./docs"
file_types = ["xlsx"]
"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_embedding_provider() {
        let mut config = parse(
            r#"
[embedding]
provider = "mystery"
"#,
        );
        assert!(config.validate().is_err());
    }
}
