//! Node configuration from environment variables.

use cloud_bus::{BusConfig, ConfigError};
use std::env;
use std::net::{Ipv4Addr, SocketAddr};

/// Everything one node process needs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bus: BusConfig,
    /// Address the HTTP server binds to
    pub listen: SocketAddr,
    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,
    /// Whether to enable JSON formatted logs
    pub json_logs: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let bus = BusConfig::default();
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, bus.http.port)),
            bus,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl NodeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - every `CLOUDBUS_*` variable read by [`BusConfig::from_env`]
    /// - `CLOUDBUS_LISTEN`: bind address (default: `0.0.0.0:<CLOUDBUS_HTTP_PORT>`)
    /// - `CLOUDBUS_LOG_LEVEL` or `RUST_LOG`: log level (default: info)
    /// - `CLOUDBUS_JSON_LOGS`: enable JSON logs (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key: &str| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bus = BusConfig::from_lookup(&lookup)?;

        let listen = match lookup("CLOUDBUS_LISTEN") {
            Some(raw) => raw.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidVar {
                name: "CLOUDBUS_LISTEN".into(),
                reason: e.to_string(),
            })?,
            None => SocketAddr::from((Ipv4Addr::UNSPECIFIED, bus.http.port)),
        };

        let log_level = lookup("CLOUDBUS_LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());

        let json_logs = match lookup("CLOUDBUS_JSON_LOGS") {
            Some(raw) => raw.trim().parse().map_err(|e: std::str::ParseBoolError| ConfigError::InvalidVar {
                name: "CLOUDBUS_JSON_LOGS".into(),
                reason: e.to_string(),
            })?,
            None => false,
        };

        Ok(Self {
            bus,
            listen,
            log_level,
            json_logs,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_listen_follows_bus_port() {
        let config = NodeConfig::from_lookup(lookup(&[("CLOUDBUS_HTTP_PORT", "9100")])).unwrap();
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_explicit_settings() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("CLOUDBUS_NODE_ID", "mn-7"),
            ("CLOUDBUS_LISTEN", "127.0.0.1:7000"),
            ("RUST_LOG", "cloud_bus=debug"),
            ("CLOUDBUS_JSON_LOGS", "true"),
        ]))
        .unwrap();
        assert_eq!(config.bus.node_id, "mn-7");
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.log_level, "cloud_bus=debug");
        assert!(config.json_logs);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_listen_address() {
        let err = NodeConfig::from_lookup(lookup(&[("CLOUDBUS_LISTEN", "nowhere")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name, .. } if name == "CLOUDBUS_LISTEN"));
    }
}
