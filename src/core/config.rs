use std::{net::IpAddr, path::Path};

use serde::{Deserialize, Serialize};

use crate::core::{guard::GuardConfig, restraint::RestraintPolicy, ticket::TicketConfig};

pub const BROKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffToken {
    pub token: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Cipher list handed to actors alongside their certificate.
    pub secure_ciphers: Option<String>,
    pub version: String,
    /// Bearer tokens accepted for staff only calls such as register.
    pub staff: Vec<StaffToken>,
    /// Peers whose `X-Forwarded-For` header names the real source. Calls from
    /// anyone else are accounted against their own address.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".into(),
            secure_ciphers: None,
            version: BROKER_VERSION.into(),
            staff: Vec::new(),
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub guard: GuardConfig,
    pub tickets: TicketConfig,
    pub restraint: RestraintPolicy,
    pub server: ServerConfig,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl BrokerConfig {
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BrokerConfig;

    #[test]
    pub fn test_empty_is_default() {
        assert_eq!(BrokerConfig::from_toml("").unwrap(), BrokerConfig::default());
        let config = BrokerConfig::default();
        assert_eq!(config.guard.allowed_fails, 5);
        assert_eq!(config.guard.block_window, Duration::from_secs(300));
        assert_eq!(config.tickets.grace, Duration::from_secs(600));
    }

    #[test]
    pub fn test_partial_sections() {
        let config = BrokerConfig::from_toml(
            r#"
            [guard]
            enabled = false
            block_delay = 1

            [restraint]
            window = 1200

            [server]
            listen = "127.0.0.1:9000"
            secure_ciphers = "ECDHE-RSA-AES256-GCM-SHA384"
            trusted_proxies = ["127.0.0.1", "::1"]

            [[server.staff]]
            token = "t0k3n"
            name = "admin"
            "#,
        )
        .unwrap();

        assert!(!config.guard.enabled);
        assert_eq!(config.guard.allowed_fails, 5);
        assert_eq!(config.guard.block_delay, Duration::from_secs(1));
        assert_eq!(config.restraint.window, Duration::from_secs(1200));
        assert_eq!(config.restraint.threshold, 3);
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.staff[0].name, "admin");
        assert_eq!(config.server.trusted_proxies.len(), 2);
        assert!(config.server.trusted_proxies[1].is_loopback());
        assert!(BrokerConfig::default().server.trusted_proxies.is_empty());
    }

    #[test]
    pub fn test_bad_toml() {
        assert!(BrokerConfig::from_toml("[guard]\nallowed_fails = \"five\"").is_err());
    }
}
