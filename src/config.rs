// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::{
    BrokerOptions, TlsOptions, DEFAULT_EXCHANGE, DEFAULT_HEARTBEAT_SECS, DEFAULT_RABBIT_URL,
};

pub const CONFIG_FILE_NAME: &str = "RabbitBroker.json";

// Configuration structures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub demo: DemoSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
    #[serde(default)]
    pub secure: bool,
    /// PEM file with the CA chain used to verify the broker.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub external_auth: bool,
    #[serde(default)]
    pub confirm_publish: bool,
    #[serde(default)]
    pub connection_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange")]
    pub name: String,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub prefetch_count: u16,
    #[serde(default)]
    pub prefetch_global: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoSettings {
    #[serde(default = "default_demo_topic")]
    pub topic: String,
    #[serde(default = "default_demo_queue")]
    pub queue: String,
}

// Default values
fn default_uri() -> String { DEFAULT_RABBIT_URL.to_string() }
fn default_heartbeat() -> u16 { DEFAULT_HEARTBEAT_SECS }
fn default_exchange() -> String { DEFAULT_EXCHANGE.to_string() }
fn default_demo_topic() -> String { "orders.created".to_string() }
fn default_demo_queue() -> String { "orders".to_string() }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            heartbeat_seconds: default_heartbeat(),
            secure: false,
            ca_cert_path: None,
            external_auth: false,
            confirm_publish: false,
            connection_name: None,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: default_exchange(),
            durable: false,
        }
    }
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            topic: default_demo_topic(),
            queue: default_demo_queue(),
        }
    }
}

impl BrokerConfig {
    /// Resolves the file settings into broker options. Reads the CA chain
    /// when one is configured.
    pub fn broker_options(&self) -> Result<BrokerOptions> {
        let mut options = BrokerOptions::default()
            .addrs([self.connection.uri.clone()])
            .secure(self.connection.secure)
            .heartbeat(self.connection.heartbeat_seconds)
            .exchange_name(self.exchange.name.clone())
            .prefetch_count(self.consumer.prefetch_count);

        if self.exchange.durable {
            options = options.durable_exchange();
        }
        if self.consumer.prefetch_global {
            options = options.prefetch_global();
        }
        if self.connection.external_auth {
            options = options.external_auth();
        }
        if self.connection.confirm_publish {
            options = options.confirm_publish();
        }
        if let Some(name) = &self.connection.connection_name {
            options = options.connection_name(name.clone());
        }
        if let Some(path) = &self.connection.ca_cert_path {
            let pem = fs::read_to_string(path)
                .with_context(|| format!("Failed to read CA chain at {}", path.display()))?;
            options = options.tls(TlsOptions {
                cert_chain: Some(pem),
            });
        }
        Ok(options)
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    let local = Path::new(CONFIG_FILE_NAME);
    if local.exists() {
        debug!("Found config file in current directory: {}", local.display());
        return Some(local.to_path_buf());
    }

    let nested = Path::new("config").join(CONFIG_FILE_NAME);
    if nested.exists() {
        debug!("Found config file in config directory: {}", nested.display());
        return Some(nested);
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<BrokerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: BrokerConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON")?;

    if config.connection.uri.is_empty() {
        return Err(anyhow!("Configuration error: connection.uri cannot be empty"));
    }
    if config.exchange.name.is_empty() {
        return Err(anyhow!("Configuration error: exchange.name cannot be empty"));
    }

    Ok(config)
}

/// Loads the first config file found, or the built-in defaults when there
/// is none.
pub fn load_config() -> Result<BrokerConfig> {
    match find_config_file() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config_from(&path)
        }
        None => {
            debug!("No {} found, using defaults", CONFIG_FILE_NAME);
            Ok(BrokerConfig::default())
        }
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&BrokerConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("rabbit-broker-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_defaults_match_broker_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.connection.uri, DEFAULT_RABBIT_URL);
        assert_eq!(config.connection.heartbeat_seconds, 10);
        assert_eq!(config.exchange.name, "idealeak");
        assert!(!config.exchange.durable);
        assert_eq!(config.consumer.prefetch_count, 0);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: BrokerConfig = serde_json::from_str(
            r#"{ "exchange": { "name": "orders", "durable": true },
                 "consumer": { "prefetch_count": 25 } }"#,
        )
        .unwrap();
        assert_eq!(config.connection.uri, DEFAULT_RABBIT_URL);
        assert_eq!(config.exchange.name, "orders");

        let options = config.broker_options().unwrap();
        assert!(options.exchange.durable);
        assert_eq!(options.prefetch_count, 25);
        assert_eq!(options.resolve_url(), DEFAULT_RABBIT_URL);
    }

    #[test]
    fn test_create_and_load_default_file() {
        let path = scratch_path(CONFIG_FILE_NAME);
        create_default_config_file(&path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, BrokerConfig::default());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_empty_uri_is_rejected() {
        let path = scratch_path("bad.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{ "connection": { "uri": "" } }"#).unwrap();

        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("connection.uri"));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let mut config = BrokerConfig::default();
        config.connection.ca_cert_path = Some(scratch_path("missing.pem"));
        let err = config.broker_options().unwrap_err();
        assert!(err.to_string().contains("Failed to read CA chain"));
    }
}
