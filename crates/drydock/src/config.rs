//! Configuration loading
//!
//! The whole configuration is parsed into typed structs once at startup and
//! rejected there; nothing in the request path inspects raw config trees.
//! Durations are humane strings ("168h", "24h", "90s").

use anyhow::{Context, Result, bail};
use rand::RngCore;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Shared secret for state signing; generated when absent
    #[serde(default)]
    pub secret: Option<String>,
}

impl HttpConfig {
    /// The configured secret, or a freshly generated one.
    ///
    /// A generated secret means upload state cannot be validated across a
    /// fleet of registries, hence the warning.
    pub fn effective_secret(&self) -> String {
        match &self.secret {
            Some(secret) => secret.clone(),
            None => {
                warn!(
                    "no http.secret configured; generated a random secret, which \
                     will break resumed state across a load-balanced deployment"
                );
                let mut raw = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut raw);
                hex::encode(raw)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// "filesystem" or "inmemory"
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_rootdirectory")]
    pub rootdirectory: String,
    #[serde(default)]
    pub delete: DeleteConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tag: TagConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            rootdirectory: default_rootdirectory(),
            delete: DeleteConfig::default(),
            redirect: RedirectConfig::default(),
            cache: CacheConfig::default(),
            tag: TagConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DeleteConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// "inmemory", "redis", or absent for no descriptor cache
    #[serde(default)]
    pub blobdescriptor: Option<String>,
    /// Entry bound for the in-memory variant
    #[serde(default = "default_blobdescriptorsize")]
    pub blobdescriptorsize: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            blobdescriptor: None,
            blobdescriptorsize: default_blobdescriptorsize(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TagConfig {
    #[serde(default)]
    pub concurrencylimit: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub uploadpurging: UploadPurgingConfig,
    #[serde(default)]
    pub readonly: ReadOnlyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadPurgingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_purge_age")]
    pub age: String,
    #[serde(default = "default_purge_interval")]
    pub interval: String,
    #[serde(default)]
    pub dryrun: bool,
}

impl Default for UploadPurgingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            age: default_purge_age(),
            interval: default_purge_interval(),
            dryrun: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ReadOnlyConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Connection URL for the redis descriptor cache
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub manifests: ManifestsValidationConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ManifestsValidationConfig {
    #[serde(default)]
    pub urls: UrlPolicyConfig,
    #[serde(default)]
    pub indexes: IndexPolicyConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct UrlPolicyConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexPolicyConfig {
    /// "all", "list", or "none"
    #[serde(default = "default_platforms")]
    pub platforms: String,
    #[serde(default)]
    pub platformlist: Vec<PlatformEntry>,
}

impl Default for IndexPolicyConfig {
    fn default() -> Self {
        Self {
            platforms: default_platforms(),
            platformlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformEntry {
    pub architecture: String,
    pub os: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub remoteurl: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Lifetime of proxied content; "0s" disables expiry
    #[serde(default = "default_proxy_ttl")]
    pub ttl: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// "none", "silly", "htpasswd", or "token"
    #[serde(default = "default_auth_mode")]
    pub mode: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Credentials file for the htpasswd controller
    #[serde(default)]
    pub htpasswd_path: Option<String>,
    /// HMAC secret for the token controller
    #[serde(default)]
    pub token_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            realm: default_realm(),
            service: default_service(),
            issuer: default_issuer(),
            htpasswd_path: None,
            token_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_endpoint_timeout")]
    pub timeout: String,
    #[serde(default = "default_endpoint_threshold")]
    pub threshold: u32,
    #[serde(default = "default_endpoint_backoff")]
    pub backoff: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_driver() -> String {
    "filesystem".to_string()
}

fn default_rootdirectory() -> String {
    "./data/registry".to_string()
}

fn default_blobdescriptorsize() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_purge_age() -> String {
    "168h".to_string()
}

fn default_purge_interval() -> String {
    "24h".to_string()
}

fn default_platforms() -> String {
    "none".to_string()
}

fn default_proxy_ttl() -> String {
    "168h".to_string()
}

fn default_auth_mode() -> String {
    "none".to_string()
}

fn default_realm() -> String {
    "drydock".to_string()
}

fn default_service() -> String {
    "drydock".to_string()
}

fn default_issuer() -> String {
    "drydock".to_string()
}

fn default_endpoint_timeout() -> String {
    "5s".to_string()
}

fn default_endpoint_threshold() -> u32 {
    5
}

fn default_endpoint_backoff() -> String {
    "1s".to_string()
}

impl Config {
    /// Load configuration from a TOML file, defaulting when it is absent.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            info!("config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {path}"))?;
        config.validate()?;
        info!("loaded configuration from {}", path);
        Ok(config)
    }

    /// Reject configurations that cannot possibly run.
    pub fn validate(&self) -> Result<()> {
        match self.storage.driver.as_str() {
            "filesystem" | "inmemory" => {}
            other => bail!("unknown storage driver: {other}"),
        }
        if let Some(kind) = self.storage.cache.blobdescriptor.as_deref() {
            match kind {
                "inmemory" => {}
                "redis" => {
                    if self.redis.url.is_none() {
                        bail!("storage.cache.blobdescriptor = \"redis\" requires redis.url");
                    }
                }
                other => bail!("unknown blob descriptor cache: {other}"),
            }
        }
        match self.validation.manifests.indexes.platforms.as_str() {
            "all" | "list" | "none" => {}
            other => bail!("unknown index platform policy: {other}"),
        }
        match self.auth.mode.as_str() {
            "none" | "silly" => {}
            "htpasswd" => {
                if self.auth.htpasswd_path.is_none() {
                    bail!("auth.mode = \"htpasswd\" requires auth.htpasswd_path");
                }
            }
            "token" => {
                if self.auth.token_secret.is_none() {
                    bail!("auth.mode = \"token\" requires auth.token_secret");
                }
            }
            other => bail!("unknown auth mode: {other}"),
        }
        // Fail on unparseable durations now, not at first use.
        parse_duration(&self.storage.maintenance.uploadpurging.age)?;
        parse_duration(&self.storage.maintenance.uploadpurging.interval)?;
        if let Some(proxy) = &self.proxy {
            parse_duration(&proxy.ttl)?;
        }
        for endpoint in &self.notifications.endpoints {
            parse_duration(&endpoint.timeout)?;
            parse_duration(&endpoint.backoff)?;
        }
        Ok(())
    }
}

/// Parse a duration string of the form `<number><unit>` with unit one of
/// `s`, `m`, `h`, `d`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&idx| idx > 0)
        .with_context(|| format!("invalid duration: {raw}"))?;
    let (value, unit) = raw.split_at(split);
    let value: u64 = value.parse().with_context(|| format!("invalid duration: {raw}"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => bail!("invalid duration unit in: {raw}"),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("168h").unwrap(), Duration::from_secs(168 * 3600));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.driver, "filesystem");
        assert!(config.storage.maintenance.uploadpurging.enabled);
        assert_eq!(config.storage.maintenance.uploadpurging.age, "168h");
        assert!(!config.storage.delete.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_a_full_config() {
        let toml = r#"
            [server]
            bind_address = "127.0.0.1"
            port = 5555

            [storage]
            driver = "inmemory"

            [storage.delete]
            enabled = true

            [storage.cache]
            blobdescriptor = "redis"

            [redis]
            url = "redis://localhost:6379"

            [storage.maintenance.uploadpurging]
            enabled = true
            age = "48h"
            interval = "1h"
            dryrun = true

            [validation]
            enabled = true

            [validation.manifests.urls]
            allow = ["^https://example\\.com/.*$"]

            [validation.manifests.indexes]
            platforms = "list"
            platformlist = [{architecture = "amd64", os = "linux"}]

            [proxy]
            remoteurl = "https://registry-1.docker.io"
            ttl = "12h"

            [[notifications.endpoints]]
            name = "audit"
            url = "https://audit.example.com/events"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 5555);
        assert!(config.storage.delete.enabled);
        assert_eq!(config.storage.cache.blobdescriptor.as_deref(), Some("redis"));
        assert!(config.storage.maintenance.uploadpurging.dryrun);
        assert_eq!(config.validation.manifests.indexes.platformlist[0].os, "linux");
        assert_eq!(config.proxy.as_ref().unwrap().ttl, "12h");
        assert_eq!(config.notifications.endpoints[0].threshold, 5);
    }

    #[test]
    fn rejects_inconsistent_configs() {
        let redis_without_url: Config = toml::from_str(
            r#"
            [storage.cache]
            blobdescriptor = "redis"
        "#,
        )
        .unwrap();
        assert!(redis_without_url.validate().is_err());

        let bad_driver: Config = toml::from_str(
            r#"
            [storage]
            driver = "s3"
        "#,
        )
        .unwrap();
        assert!(bad_driver.validate().is_err());

        assert!(toml::from_str::<Config>("[storage]\nunknown_key = 1").is_err());
    }

    #[test]
    fn generated_secret_is_32_bytes_of_hex() {
        let http = HttpConfig { secret: None };
        let secret = http.effective_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.bytes().all(|b| b.is_ascii_hexdigit()));

        let configured = HttpConfig {
            secret: Some("fixed".to_string()),
        };
        assert_eq!(configured.effective_secret(), "fixed");
    }
}
