use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Deployment configuration, read from a TOML file (located by the
/// `CONFIG_PATH` environment variable unless given explicitly) with a few
/// environment overrides on top.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub main: MainConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(skip)]
    pub environment: EnvironmentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    /// Enable reconciliation for the proxy data plane.
    #[serde(default)]
    pub manage_proxy: bool,
    /// Enable reconciliation for the VPN data plane.
    #[serde(default)]
    pub manage_vpn: bool,
    /// Hard cap on user rows; 0 means unlimited.
    #[serde(default)]
    pub max_users: i64,
    /// Hard cap on users with an active plan; 0 means unlimited.
    #[serde(default)]
    pub max_active_users: i64,
    /// Per-call data-plane timeout in seconds.
    #[serde(default = "default_service_timeout")]
    pub service_timeout: u64,
    /// Seconds between monitor ticks.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,
    /// Passive loop period, in ticks. Non-positive disables it.
    #[serde(default = "default_monitor_passive_steps")]
    pub monitor_passive_steps: i64,
    /// Delete users a data plane reports but the catalog does not know.
    #[serde(default)]
    pub monitor_zombies: bool,
    /// Directory for the sockets, the lock file and the user list.
    pub temp_path: PathBuf,
    pub proxy_api_socket_path: PathBuf,
    pub vpn_broker_socket_path: PathBuf,
    /// Used by the administrative API to fetch the canonical 404 body.
    #[serde(default)]
    pub nginx_fallback_socket_path: Option<PathBuf>,
    /// Inbound tags the proxy add/delete operations are issued against.
    #[serde(default = "default_proxy_inbounds")]
    pub proxy_inbounds: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Seconds between periodic backups; non-positive disables them.
    #[serde(default)]
    pub backup_interval: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Spawn the administrative API worker process.
    #[serde(default)]
    pub enable: bool,
    /// Shared secret for the API and the state synchronizer.
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Settings that come from the deployment environment rather than the
/// configuration file.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentConfig {
    pub domain: String,
    pub tls_port: String,
    pub proxy_sni: String,
}

fn default_service_timeout() -> u64 {
    10
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_monitor_passive_steps() -> i64 {
    10
}

fn default_proxy_inbounds() -> Vec<String> {
    vec!["vless-tcp".to_owned()]
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Config {
    /// Loads the configuration, applying the `API_KEY`, `ENABLE_API`,
    /// `DOMAIN`, `TLS_PORT` and `PROXY_SNI` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(
                env::var("CONFIG_PATH").context("CONFIG_PATH is not set and no --config given")?,
            ),
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse '{}'", path.display()))?;

        if let Ok(key) = env::var("API_KEY") {
            config.api.key = key;
        }
        if env::var("ENABLE_API").is_ok_and(|value| !value.is_empty()) {
            config.api.enable = true;
        }
        config.environment = EnvironmentConfig {
            domain: env::var("DOMAIN").unwrap_or_default(),
            tls_port: env::var("TLS_PORT").unwrap_or_else(|_| "443".to_owned()),
            proxy_sni: env::var("PROXY_SNI").unwrap_or_default(),
        };

        std::fs::create_dir_all(&config.main.temp_path)
            .with_context(|| format!("failed to create '{}'", config.main.temp_path.display()))?;
        Ok(config)
    }

    pub fn state_socket_path(&self) -> PathBuf {
        self.main.temp_path.join("manager.sock")
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.main.temp_path.join("lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [main]
            manage_proxy = true
            temp_path = "/tmp/warden"
            proxy_api_socket_path = "/run/proxy/api.sock"
            vpn_broker_socket_path = "/run/vpn/broker.sock"

            [database]
            path = "/var/lib/warden/warden.db"

            [api]
            key = "secret"
            "#,
        )
        .unwrap();

        assert!(config.main.manage_proxy);
        assert!(!config.main.manage_vpn);
        assert_eq!(config.main.service_timeout, 10);
        assert_eq!(config.main.monitor_passive_steps, 10);
        assert_eq!(config.main.proxy_inbounds, vec!["vless-tcp"]);
        assert_eq!(config.database.backup_interval, 0);
        assert!(!config.api.enable);
        assert_eq!(config.log.level, "info");
    }
}
