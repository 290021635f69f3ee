//! # Configuration
//!
//! TOML file (default `rowvault.toml`) overlaid with environment variables.
//!
//! ## Environment Overrides
//!
//! - `ROWVAULT_DATA_DIR`: root directory for per-tenant data
//! - `ROWVAULT_PLATFORM_URL`: platform the results come from (tenant source)
//! - `ROWVAULT_TENANT`: explicit tenant, wins over the URL-derived one
//! - `ROWVAULT_RATE_LIMIT`: requests per second, 0 disables
//!
//! A missing default file means defaults. A file named explicitly must exist.

use rowvault_core::primitives::{
    AUTO_BLOOM_THRESHOLD, DEFAULT_ANALYTICS_ROW_LIMIT, DEFAULT_CACHE_ENTRIES, DEFAULT_CHUNK_SIZE,
    DEFAULT_FALSE_POSITIVE_RATE, DEFAULT_SIMILARITY_THRESHOLD,
};
use rowvault_core::types::MAX_TENANT_LENGTH;
use rowvault_core::{CacheConfig, TenantId, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file looked up when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "rowvault.toml";

/// Tenant used when the platform URL yields nothing usable.
const FALLBACK_TENANT: &str = "default";

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub default_chunk_size: usize,
    /// Results with strictly more rows get a filter built on store.
    pub auto_bloom_threshold: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            auto_bloom_threshold: AUTO_BLOOM_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    pub false_positive_rate: f64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub similarity_threshold: f32,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_ENTRIES,
            ttl_secs: 3600,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD as f32,
        }
    }
}

impl CacheSection {
    /// Core cache configuration for this section.
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            ttl_ms: self.ttl_secs.saturating_mul(1000),
            similarity_threshold: self.similarity_threshold,
            ..CacheConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub default_row_limit: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            default_row_limit: DEFAULT_ANALYTICS_ROW_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit: u32,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rate_limit: 100,
            body_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub platform_url: String,
    /// Explicit tenant; empty means "derive from `platform_url`".
    pub tenant: String,
    pub chunking: ChunkingConfig,
    pub bloom: BloomConfig,
    pub cache: CacheSection,
    pub analytics: AnalyticsConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./rowvault-data"),
            platform_url: "https://fwd.app".to_string(),
            tenant: String::new(),
            chunking: ChunkingConfig::default(),
            bloom: BloomConfig::default(),
            cache: CacheSection::default(),
            analytics: AnalyticsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load the file (if any) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, VaultError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, VaultError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VaultError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&text).map_err(|e| match e {
            VaultError::InvalidArgument(msg) => {
                VaultError::InvalidArgument(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, VaultError> {
        toml::from_str(text).map_err(|e| VaultError::InvalidArgument(format!("Invalid config: {}", e)))
    }

    /// Apply `ROWVAULT_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = lookup("ROWVAULT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("ROWVAULT_PLATFORM_URL") {
            self.platform_url = url;
        }
        if let Some(tenant) = lookup("ROWVAULT_TENANT") {
            self.tenant = tenant;
        }
        if let Some(raw) = lookup("ROWVAULT_RATE_LIMIT") {
            match raw.trim().parse() {
                Ok(limit) => self.server.rate_limit = limit,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid ROWVAULT_RATE_LIMIT"),
            }
        }
    }

    /// Tenant this process serves.
    ///
    /// An explicit tenant must already be valid. Otherwise the platform URL's
    /// host is lowercased and sanitized.
    pub fn tenant_id(&self) -> Result<TenantId, VaultError> {
        let explicit = self.tenant.trim();
        if !explicit.is_empty() {
            return TenantId::new(explicit);
        }
        TenantId::new(tenant_from_url(&self.platform_url))
    }

    /// Bind address for the HTTP server.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Derive a tenant name from the host part of a URL.
pub fn tenant_from_url(url: &str) -> String {
    let rest = url.trim();
    let rest = rest.split_once("://").map_or(rest, |(_, r)| r);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
    let host = host_port.split(':').next().unwrap_or_default();

    let sanitized: String = host
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_TENANT_LENGTH)
        .collect();

    let trimmed = sanitized.trim_matches(['.', '-']);
    if trimmed.is_empty() {
        FALLBACK_TENANT.to_string()
    } else {
        trimmed.to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn defaults_when_file_is_empty() {
        let config = Config::from_toml("").expect("empty config");
        assert_eq!(config, Config::default());
        assert_eq!(config.chunking.default_chunk_size, 200);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            data_dir = "/var/lib/rowvault"

            [cache]
            ttl_secs = 60

            [server]
            port = 9090
            "#,
        )
        .expect("config");

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/rowvault"));
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.cache.to_cache_config().ttl_ms, 60_000);
    }

    #[test]
    fn malformed_toml_is_invalid_argument() {
        assert!(matches!(
            Config::from_toml("[server\nport = 1"),
            Err(VaultError::InvalidArgument(_))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: BTreeMap<&str, &str> = [
            ("ROWVAULT_DATA_DIR", "/tmp/rv"),
            ("ROWVAULT_TENANT", "acme"),
            ("ROWVAULT_RATE_LIMIT", "0"),
            ("ROWVAULT_PLATFORM_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/tmp/rv"));
        assert_eq!(config.tenant, "acme");
        assert_eq!(config.server.rate_limit, 0);
        assert_eq!(config.platform_url, "https://fwd.app");
    }

    #[test]
    fn invalid_rate_limit_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == "ROWVAULT_RATE_LIMIT").then(|| "fast".to_string()));
        assert_eq!(config.server.rate_limit, 100);
    }

    #[test]
    fn tenant_derived_from_platform_host() {
        assert_eq!(tenant_from_url("https://fwd.app"), "fwd.app");
        assert_eq!(tenant_from_url("https://User@Fwd.Example.com:8443/api?x=1"), "fwd.example.com");
        assert_eq!(tenant_from_url("fwd.internal/path"), "fwd.internal");
        assert_eq!(tenant_from_url("https://"), "default");
        assert_eq!(tenant_from_url("http://[::1]:8080"), "default");
    }

    #[test]
    fn explicit_tenant_wins_and_is_validated() {
        let mut config = Config::default();
        assert_eq!(config.tenant_id().expect("tenant").as_str(), "fwd.app");

        config.tenant = "team-a".to_string();
        assert_eq!(config.tenant_id().expect("tenant").as_str(), "team-a");

        config.tenant = "../etc".to_string();
        assert!(config.tenant_id().is_err());
    }
}
