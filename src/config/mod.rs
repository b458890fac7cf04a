//! # Configuration
//!
//! TOML configuration for the forward proxy:
//!
//! - file loading with `${VAR}` / `${VAR:-default}` expansion
//! - serde defaults mirroring a minimal working proxy (`0.0.0.0:8080`, everything optional off)
//! - validation of the cache settings and duration strings
//! - hot reload through [`ConfigManager`]
//!
//! Keys may be written in snake_case or kebab-case (`forward_proxy` / `forward-proxy`).
//!
//! ```rust,no_run
//! use fwdproxy::config::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::from_file_with_env("config.toml").await?;
//! println!("listening on {}", config.listen_addr());
//! # Ok(())
//! # }
//! ```

pub mod duration;
pub mod manager;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ProxyError, ProxyResult};

pub use duration::parse_duration;
pub use manager::{ConfigManager, SnapshotCell, SnapshotSource};

const DEFAULT_CACHE_TTL: &str = "7d";
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Root configuration snapshot.
///
/// Immutable once built; reloads produce a new value behind a new `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Listener, static files and forward proxy
    pub http: HttpConfig,
    /// Background cache eviction
    #[serde(alias = "proxy-cache-cleanup")]
    pub proxy_cache_cleanup: CacheCleanupConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub addr: String,
    pub port: u16,
    #[serde(rename = "static")]
    pub static_files: StaticConfig,
    #[serde(alias = "forward-proxy")]
    pub forward_proxy: ForwardProxyConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "0.0.0.0".to_string(),
            port: 8080,
            static_files: StaticConfig::default(),
            forward_proxy: ForwardProxyConfig::default(),
        }
    }
}

/// Static directories served under `/static/<route>/`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StaticConfig {
    pub enabled: bool,
    /// Route key -> directory
    pub dirs: BTreeMap<String, StaticDirConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StaticDirConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardProxyConfig {
    pub enabled: bool,
    /// Hosts whose responses are cached (exact match, case-insensitive, port ignored)
    pub domains: Vec<String>,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(alias = "cache-dir")]
    pub cache_dir: PathBuf,
    #[serde(alias = "cache-ttl")]
    pub cache_ttl: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_dir: PathBuf::new(),
            cache_ttl: DEFAULT_CACHE_TTL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheCleanupConfig {
    pub interval: String,
}

impl Default for CacheCleanupConfig {
    fn default() -> Self {
        Self {
            interval: "1h".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable expansion
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Like [`Config::from_file_with_env`], but a missing file yields the defaults
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match tokio::fs::metadata(path.as_ref()).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Config file {:?} not found, running with default configuration",
                    path.as_ref()
                );
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            _ => Self::from_file_with_env(path).await,
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject snapshots the proxy cannot run with
    pub fn validate(&self) -> ProxyResult<()> {
        let proxy = &self.http.forward_proxy;
        if proxy.enabled && proxy.cache.enabled {
            if proxy.cache.cache_dir.as_os_str().is_empty() {
                return Err(ProxyError::config(
                    "http.forward_proxy.cache.enabled is true, but cache_dir is not set",
                ));
            }
            proxy.cache.ttl().map_err(|e| {
                ProxyError::config(format!(
                    "invalid http.forward_proxy.cache.cache_ttl '{}': {}",
                    proxy.cache.cache_ttl, e
                ))
            })?;
        }

        if self.evictor_should_run() {
            self.proxy_cache_cleanup.interval().map_err(|e| {
                ProxyError::config(format!(
                    "invalid proxy_cache_cleanup.interval '{}': {}",
                    self.proxy_cache_cleanup.interval, e
                ))
            })?;
        }

        if self.http.enabled && self.http.addr.trim().is_empty() {
            return Err(ProxyError::config("http.addr must not be empty"));
        }

        Ok(())
    }

    /// Whether the background cache evictor belongs in the topology
    pub fn evictor_should_run(&self) -> bool {
        let proxy = &self.http.forward_proxy;
        proxy.enabled && proxy.cache.enabled && !proxy.cache.cache_dir.as_os_str().is_empty()
    }

    /// `addr:port` string the listener binds to
    pub fn listen_addr(&self) -> String {
        if self.http.addr.contains(':') && !self.http.addr.starts_with('[') {
            format!("[{}]:{}", self.http.addr, self.http.port)
        } else {
            format!("{}:{}", self.http.addr, self.http.port)
        }
    }
}

impl ForwardProxyConfig {
    /// Checks if a given host should be cached. Case-insensitive, port ignored.
    pub fn should_cache_domain(&self, host: &str) -> bool {
        if !self.cache.enabled || self.cache.cache_dir.as_os_str().is_empty() {
            return false;
        }
        let host = host_without_port(host);
        self.domains
            .iter()
            .any(|domain| domain.eq_ignore_ascii_case(host))
    }
}

impl CacheConfig {
    /// Parsed TTL; an empty string means the default of 7 days
    pub fn ttl(&self) -> ProxyResult<Duration> {
        if self.cache_ttl.trim().is_empty() {
            return parse_duration(DEFAULT_CACHE_TTL);
        }
        parse_duration(&self.cache_ttl)
    }
}

impl CacheCleanupConfig {
    /// Parsed sweep interval. Empty or non-positive falls back to one hour.
    pub fn interval(&self) -> ProxyResult<Duration> {
        if self.interval.trim().is_empty() {
            return Ok(DEFAULT_CLEANUP_INTERVAL);
        }
        let interval = parse_duration(&self.interval)?;
        if interval.is_zero() {
            warn!(
                "proxy_cache_cleanup.interval '{}' is not positive, using default 1h",
                self.interval
            );
            return Ok(DEFAULT_CLEANUP_INTERVAL);
        }
        Ok(interval)
    }
}

/// Strip an optional `:port` suffix, handling bracketed IPv6 literals
pub fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        // A bare IPv6 address has more than one colon and no port
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Expand environment variables in configuration content
/// Supports ${VAR} and ${VAR:-default} syntax
fn expand_env_vars(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break; // Malformed ${VAR expression
        };
        result.push_str(&rest[..start]);

        let var_expr = &rest[start + 2..start + end];
        let replacement = match var_expr.split_once(":-") {
            Some((name, default)) => env::var(name).unwrap_or_else(|_| default.to_string()),
            None => env::var(var_expr).unwrap_or_else(|_| {
                warn!(
                    "Environment variable '{}' not found, using empty string",
                    var_expr
                );
                String::new()
            }),
        };
        result.push_str(&replacement);
        rest = &rest[start + end + 1..];
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper function to create a temporary config file
    fn create_temp_config_file(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[tokio::test]
    async fn test_basic_config_loading() {
        let config_content = r#"
[http]
addr = "127.0.0.1"
port = 3128

[http.static]
enabled = true
[http.static.dirs.assets]
path = "/srv/assets"

[http.forward_proxy]
enabled = true
domains = ["Example.com", "cdn.example.org"]

[http.forward_proxy.cache]
enabled = true
cache_dir = "/var/cache/fwdproxy"
cache_ttl = "1d"

[proxy_cache_cleanup]
interval = "30m"
"#;

        let temp_file = create_temp_config_file(config_content);
        let config = Config::from_file_with_env(temp_file.path()).await.unwrap();

        assert!(config.http.enabled);
        assert_eq!(config.listen_addr(), "127.0.0.1:3128");
        assert!(config.http.static_files.enabled);
        assert_eq!(
            config.http.static_files.dirs["assets"].path,
            PathBuf::from("/srv/assets")
        );
        assert_eq!(
            config.http.forward_proxy.cache.ttl().unwrap(),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            config.proxy_cache_cleanup.interval().unwrap(),
            Duration::from_secs(1800)
        );
        assert!(config.evictor_should_run());
    }

    #[test]
    fn test_kebab_case_keys() {
        let config = Config::from_toml_str(
            r#"
[http.forward-proxy]
enabled = true

[http.forward-proxy.cache]
enabled = true
cache-dir = "/tmp/cache"
cache-ttl = "2w"

[proxy-cache-cleanup]
interval = "10m"
"#,
        )
        .unwrap();

        assert!(config.http.forward_proxy.enabled);
        assert_eq!(
            config.http.forward_proxy.cache.cache_dir,
            PathBuf::from("/tmp/cache")
        );
        assert_eq!(config.proxy_cache_cleanup.interval, "10m");
    }

    #[tokio::test]
    async fn test_config_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert!(config.http.enabled);
        assert_eq!(config.http.addr, "0.0.0.0");
        assert_eq!(config.http.port, 8080);
        assert!(!config.http.static_files.enabled);
        assert!(!config.http.forward_proxy.enabled);
        assert!(!config.http.forward_proxy.cache.enabled);
        assert_eq!(config.http.forward_proxy.cache.cache_ttl, "7d");
        assert_eq!(config.proxy_cache_cleanup.interval, "1h");
        assert!(!config.evictor_should_run());
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_env_var_expansion() {
        env::set_var("FWDPROXY_TEST_PORT", "9191");
        env::remove_var("FWDPROXY_TEST_MISSING");

        let content = "port = ${FWDPROXY_TEST_PORT}\naddr = \"${FWDPROXY_TEST_MISSING:-127.0.0.1}\"";
        let expanded = expand_env_vars(content);
        assert_eq!(expanded, "port = 9191\naddr = \"127.0.0.1\"");

        let unterminated = "dir = \"${UNTERMINATED\"";
        assert_eq!(expand_env_vars(unterminated), unterminated);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.http.forward_proxy.enabled = true;
        config.http.forward_proxy.cache.enabled = true;
        assert!(config.validate().is_err(), "cache without dir must fail");

        config.http.forward_proxy.cache.cache_dir = PathBuf::from("/tmp/c");
        config.http.forward_proxy.cache.cache_ttl = "seven days".to_string();
        assert!(config.validate().is_err(), "bad ttl must fail");

        config.http.forward_proxy.cache.cache_ttl = "7d".to_string();
        config.proxy_cache_cleanup.interval = "often".to_string();
        assert!(config.validate().is_err(), "bad interval must fail");

        config.proxy_cache_cleanup.interval = "0".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.proxy_cache_cleanup.interval().unwrap(),
            DEFAULT_CLEANUP_INTERVAL
        );

        // Cache settings are ignored while the proxy itself is off
        config.http.forward_proxy.enabled = false;
        config.http.forward_proxy.cache.cache_dir = PathBuf::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_should_cache_domain() {
        let mut proxy = ForwardProxyConfig {
            enabled: true,
            domains: vec!["Example.COM".to_string()],
            cache: CacheConfig {
                enabled: true,
                cache_dir: PathBuf::from("/tmp/c"),
                cache_ttl: "1d".to_string(),
            },
        };

        assert!(proxy.should_cache_domain("example.com"));
        assert!(proxy.should_cache_domain("EXAMPLE.com:8080"));
        assert!(!proxy.should_cache_domain("www.example.com"));

        proxy.cache.enabled = false;
        assert!(!proxy.should_cache_domain("example.com"));
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("example.com:80"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:8080"), "::1");
        assert_eq!(host_without_port("::1"), "::1");
        assert_eq!(host_without_port("127.0.0.1:3128"), "127.0.0.1");
    }
}
