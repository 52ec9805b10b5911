use std::env;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::BrokerConfig;

pub const RABBITMQ_URI: &str = "RABBITMQ_URI";
pub const RABBITMQ_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const RABBITMQ_DURABLE_EXCHANGE: &str = "RABBITMQ_DURABLE_EXCHANGE";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const RABBITMQ_PREFETCH_GLOBAL: &str = "RABBITMQ_PREFETCH_GLOBAL";
pub const RABBITMQ_SECURE: &str = "RABBITMQ_SECURE";

/// Environment settings that take precedence over the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub uri: Option<String>,
    pub exchange: Option<String>,
    pub durable_exchange: Option<bool>,
    pub prefetch_count: Option<u16>,
    pub prefetch_global: Option<bool>,
    pub secure: Option<bool>,
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got '{}'", name, other),
    }
}

impl EnvOverrides {
    /// Reads the process environment, after loading `.env` if present.
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let flag = |name: &str| -> Result<Option<bool>> {
            lookup(name).map(|v| parse_flag(name, &v)).transpose()
        };
        Ok(EnvOverrides {
            uri: lookup(RABBITMQ_URI).filter(|v| !v.is_empty()),
            exchange: lookup(RABBITMQ_EXCHANGE).filter(|v| !v.is_empty()),
            durable_exchange: flag(RABBITMQ_DURABLE_EXCHANGE)?,
            prefetch_count: lookup(RABBITMQ_PREFETCH_COUNT)
                .map(|v| {
                    v.trim().parse::<u16>().with_context(|| {
                        format!("{} must be a number, got '{}'", RABBITMQ_PREFETCH_COUNT, v)
                    })
                })
                .transpose()?,
            prefetch_global: flag(RABBITMQ_PREFETCH_GLOBAL)?,
            secure: flag(RABBITMQ_SECURE)?,
        })
    }

    pub fn apply(&self, config: &mut BrokerConfig) {
        if let Some(uri) = &self.uri {
            config.connection.uri = uri.clone();
        }
        if let Some(exchange) = &self.exchange {
            config.exchange.name = exchange.clone();
        }
        if let Some(durable) = self.durable_exchange {
            config.exchange.durable = durable;
        }
        if let Some(count) = self.prefetch_count {
            config.consumer.prefetch_count = count;
        }
        if let Some(global) = self.prefetch_global {
            config.consumer.prefetch_global = global;
        }
        if let Some(secure) = self.secure {
            config.connection.secure = secure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_no_variables_changes_nothing() {
        let overrides = EnvOverrides::from_lookup(lookup(&[])).unwrap();
        assert_eq!(overrides, EnvOverrides::default());

        let mut config = BrokerConfig::default();
        overrides.apply(&mut config);
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let overrides = EnvOverrides::from_lookup(lookup(&[
            (RABBITMQ_URI, "amqp://user:pw@rabbit:5672/%2fvhost"),
            (RABBITMQ_EXCHANGE, "orders"),
            (RABBITMQ_DURABLE_EXCHANGE, "true"),
            (RABBITMQ_PREFETCH_COUNT, "20"),
            (RABBITMQ_PREFETCH_GLOBAL, "1"),
            (RABBITMQ_SECURE, "no"),
        ]))
        .unwrap();

        let mut config = BrokerConfig::default();
        overrides.apply(&mut config);
        assert_eq!(config.connection.uri, "amqp://user:pw@rabbit:5672/%2fvhost");
        assert_eq!(config.exchange.name, "orders");
        assert!(config.exchange.durable);
        assert_eq!(config.consumer.prefetch_count, 20);
        assert!(config.consumer.prefetch_global);
        assert!(!config.connection.secure);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(EnvOverrides::from_lookup(lookup(&[(RABBITMQ_PREFETCH_COUNT, "many")])).is_err());
        assert!(EnvOverrides::from_lookup(lookup(&[(RABBITMQ_SECURE, "maybe")])).is_err());
    }
}
