//! TOML configuration with per-section defaults.
//!
//! Every field has a default, so an absent or empty config file yields a
//! working instance. The data directory resolves to the platform app-data
//! location unless `[storage] data_dir` overrides it.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// User accounts and bearer tokens
    #[serde(default)]
    pub auth: AuthConfig,

    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Messaging engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind host (loopback unless explicitly changed)
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Login attempts allowed per client per minute (0 = unlimited)
    #[serde(default = "default_login_rate")]
    pub login_rate_per_minute: u32,

    /// Message sends allowed per client per minute (0 = unlimited)
    #[serde(default = "default_send_rate")]
    pub send_rate_per_minute: u32,

    /// Allow binding to a non-loopback host. Off by default; turn on only
    /// behind a reverse proxy you trust.
    #[serde(default)]
    pub allow_public_bind: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            login_rate_per_minute: default_login_rate(),
            send_rate_per_minute: default_send_rate(),
            allow_public_bind: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_login_rate() -> u32 {
    10
}

fn default_send_rate() -> u32 {
    30
}

/// Account and token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Whether new user registration is allowed
    #[serde(default = "default_true")]
    pub allow_registration: bool,

    /// Maximum registered users (0 = unlimited)
    #[serde(default)]
    pub max_users: u64,

    /// Bearer token lifetime in seconds
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_registration: true,
            max_users: 0,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_token_ttl() -> u64 {
    30 * 24 * 3600
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a pairing code stays presentable after the engine emits it
    #[serde(default = "default_pairing_code_ttl")]
    pub pairing_code_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pairing_code_ttl_secs: default_pairing_code_ttl(),
        }
    }
}

fn default_pairing_code_ttl() -> u64 {
    60
}

/// Messaging engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Initialization attempts before a cycle is reported as failed
    #[serde(default = "default_max_init_attempts")]
    pub max_init_attempts: u32,

    /// Base backoff between initialization attempts (milliseconds,
    /// multiplied by the attempt number)
    #[serde(default = "default_init_retry_backoff_ms")]
    pub init_retry_backoff_ms: u64,

    /// Dev mode: the simulated engine scans its own pairing code
    #[serde(default)]
    pub auto_pair: bool,

    /// Delay before the simulated auto-scan (milliseconds)
    #[serde(default = "default_auto_pair_delay_ms")]
    pub auto_pair_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_init_attempts: default_max_init_attempts(),
            init_retry_backoff_ms: default_init_retry_backoff_ms(),
            auto_pair: false,
            auto_pair_delay_ms: default_auto_pair_delay_ms(),
        }
    }
}

fn default_max_init_attempts() -> u32 {
    3
}

fn default_init_retry_backoff_ms() -> u64 {
    500
}

fn default_auto_pair_delay_ms() -> u64 {
    1500
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Data directory override; platform app-data location when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration. An explicit path must exist; the default
    /// location may be absent, in which case defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_config_path(), false),
        };

        if !path.exists() {
            if required {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// `<config dir>/waygate/config.toml`, falling back to the working
    /// directory when the platform dirs cannot be resolved.
    pub fn default_config_path() -> PathBuf {
        ProjectDirs::from("com", "waygate", "waygate")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Directory all databases live in.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.data_dir {
            return dir.clone();
        }
        ProjectDirs::from("com", "waygate", "waygate")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("waygate-data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 3000);
        assert!(!config.gateway.allow_public_bind);
        assert!(config.auth.allow_registration);
        assert_eq!(config.auth.max_users, 0);
        assert_eq!(config.session.pairing_code_ttl_secs, 60);
        assert_eq!(config.engine.max_init_attempts, 3);
        assert!(!config.engine.auto_pair);
        assert!(config.storage.data_dir.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            port = 8080

            [engine]
            auto_pair = true
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert!(config.engine.auto_pair);
        assert_eq!(config.engine.auto_pair_delay_ms, 1500);
        assert_eq!(config.auth.token_ttl_secs, 30 * 24 * 3600);
    }

    #[test]
    fn data_dir_override_wins() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            data_dir = "/tmp/waygate-test"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir(), PathBuf::from("/tmp/waygate-test"));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/waygate.toml")));
        assert!(result.is_err());
    }
}
