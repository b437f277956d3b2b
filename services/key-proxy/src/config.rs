//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Upstream API keys come from UPSTREAM_API_KEYS or `pool.keys_file`, and the
//! access key from ACCESS_KEY or `access.key_file`; secrets are never stored
//! in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Upstream API base, e.g. `https://openrouter.ai/api/v1`
    pub upstream_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Key rotation settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// How long a rate-limited key is parked when the upstream gives no resume time
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Preventive park applied to a key after each `google/` model completion
    #[serde(default)]
    pub google_model_cooldown_secs: u64,
    /// File with one key per line (alternative to UPSTREAM_API_KEYS)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            google_model_cooldown_secs: 0,
            keys_file: None,
            keys: Vec::new(),
        }
    }
}

/// Model catalog settings
#[derive(Debug, Default, Deserialize)]
pub struct CatalogConfig {
    /// Only list models whose pricing is entirely zero
    #[serde(default)]
    pub free_only: bool,
}

/// Client access key settings
#[derive(Debug, Default, Deserialize)]
pub struct AccessConfig {
    /// File holding the access key (alternative to ACCESS_KEY)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(skip)]
    pub key: Option<Secret<String>>,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

fn default_cooldown() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Key resolution order:
    /// 1. UPSTREAM_API_KEYS env var (comma or newline separated)
    /// 2. keys_file path from config
    ///
    /// An empty key list is an error.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Validate upstream_url is a valid URL with http(s) scheme
        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.connect_timeout_secs == 0 {
            return Err(common::Error::Config(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.cooldown_secs == 0 {
            return Err(common::Error::Config(
                "cooldown_secs must be greater than 0".into(),
            ));
        }

        // Resolve upstream keys: env var takes precedence over file
        config.pool.keys = match std::env::var("UPSTREAM_API_KEYS") {
            Ok(raw) => parse_keys(&raw),
            Err(_) => match config.pool.keys_file {
                Some(ref keys_file) => parse_keys(&read_secret_file(keys_file, "keys_file")?),
                None => Vec::new(),
            },
        };
        if config.pool.keys.is_empty() {
            return Err(common::Error::Config(
                "no upstream API keys configured (set UPSTREAM_API_KEYS or pool.keys_file)".into(),
            ));
        }

        // Resolve access key: env var takes precedence over file
        if let Ok(key) = std::env::var("ACCESS_KEY") {
            config.access.key = non_empty(&key);
        } else if let Some(ref key_file) = config.access.key_file {
            config.access.key = non_empty(&read_secret_file(key_file, "access.key_file")?);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("llm-key-proxy.toml")
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.pool.cooldown_secs)
    }

    pub fn google_model_cooldown(&self) -> Duration {
        Duration::from_secs(self.pool.google_model_cooldown_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.connect_timeout_secs)
    }
}

fn read_secret_file(path: &Path, field: &str) -> common::Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read {field} {}: {e}", path.display()))
    })
}

/// Split a key list on commas and newlines, dropping blank entries.
fn parse_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .filter_map(non_empty)
        .collect()
}

fn non_empty(raw: &str) -> Option<Secret<String>> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| Secret::new(trimmed.to_owned()))
}
