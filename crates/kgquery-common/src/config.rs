use serde::{Deserialize, Serialize};
use config::{Config, ConfigError, Environment, File};
use std::collections::HashMap;

// --- Constants for Default Configuration ---
pub const DEFAULT_CACHE_CAPACITY: usize = 100;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

pub const DEFAULT_SLOW_QUERY_THRESHOLD_SECS: f64 = 1.0;
pub const DEFAULT_MAX_PAGE_LIMIT: i64 = 1000;
pub const DEFAULT_PARAMETER_PREVIEW_LEN: usize = 100;
pub const DEFAULT_PLAN_PREVIEW_LEN: usize = 100;
pub const DEFAULT_METRICS_CAPACITY: usize = 0;
pub const DEFAULT_FULLTEXT_INDEX: &str = "entity_name_search";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime in seconds; 0 disables expiry.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize { DEFAULT_CACHE_CAPACITY }
fn default_cache_ttl() -> u64 { DEFAULT_CACHE_TTL_SECS }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default = "default_slow_query_threshold")]
    pub slow_query_threshold_secs: f64,
    /// Hard ceiling applied to every requested page size.
    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: i64,
    /// Results with more rows than this are never cached. `None` = unlimited.
    #[serde(default)]
    pub max_cacheable_rows: Option<usize>,
    #[serde(default = "default_parameter_preview_len")]
    pub parameter_preview_len: usize,
    #[serde(default = "default_plan_preview_len")]
    pub plan_preview_len: usize,
    /// Maximum number of distinct query keys tracked; 0 = unbounded.
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
    #[serde(default = "default_fulltext_index")]
    pub fulltext_index: String,
}

fn default_slow_query_threshold() -> f64 { DEFAULT_SLOW_QUERY_THRESHOLD_SECS }
fn default_max_page_limit() -> i64 { DEFAULT_MAX_PAGE_LIMIT }
fn default_parameter_preview_len() -> usize { DEFAULT_PARAMETER_PREVIEW_LEN }
fn default_plan_preview_len() -> usize { DEFAULT_PLAN_PREVIEW_LEN }
fn default_metrics_capacity() -> usize { DEFAULT_METRICS_CAPACITY }
fn default_fulltext_index() -> String { DEFAULT_FULLTEXT_INDEX.to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KgQueryConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    /// Label -> indexed property names, most selective first.
    /// Replaces the built-in table when present.
    #[serde(default)]
    pub index_hints: Option<HashMap<String, Vec<String>>>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            slow_query_threshold_secs: DEFAULT_SLOW_QUERY_THRESHOLD_SECS,
            max_page_limit: DEFAULT_MAX_PAGE_LIMIT,
            max_cacheable_rows: None,
            parameter_preview_len: DEFAULT_PARAMETER_PREVIEW_LEN,
            plan_preview_len: DEFAULT_PLAN_PREVIEW_LEN,
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
            fulltext_index: DEFAULT_FULLTEXT_INDEX.to_string(),
        }
    }
}

impl KgQueryConfig {
    /// Layered load: defaults, then `kgquery.toml` if present, then
    /// `KGQUERY__SECTION__KEY` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("kgquery")
    }

    pub fn load_from(file_stem: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("cache.capacity", DEFAULT_CACHE_CAPACITY as i64)?
            .set_default("cache.ttl_secs", DEFAULT_CACHE_TTL_SECS)?
            .set_default("optimizer.slow_query_threshold_secs", DEFAULT_SLOW_QUERY_THRESHOLD_SECS)?
            .set_default("optimizer.max_page_limit", DEFAULT_MAX_PAGE_LIMIT)?
            .set_default("optimizer.parameter_preview_len", DEFAULT_PARAMETER_PREVIEW_LEN as i64)?
            .set_default("optimizer.plan_preview_len", DEFAULT_PLAN_PREVIEW_LEN as i64)?
            .set_default("optimizer.metrics_capacity", DEFAULT_METRICS_CAPACITY as i64)?
            .set_default("optimizer.fulltext_index", DEFAULT_FULLTEXT_INDEX)?

            .add_source(File::with_name(file_stem).required(false))

            // KGQUERY__CACHE__TTL_SECS=60 -> cache.ttl_secs=60
            .add_source(Environment::with_prefix("KGQUERY").separator("__").try_parsing(true))

            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn cache_ttl_enabled(&self) -> bool {
        self.cache.ttl_secs > 0
    }
}
