//! Bus configuration with validation.

use crate::destination::ManagementNode;
use crate::message::{Message, MessageKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Base path of the bus endpoint.
pub const HTTP_BASE_PATH: &str = "/cloudbus";

/// Main bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Id of this management node
    pub node_id: String,
    /// Address peers use to reach this node
    pub node_ip: IpAddr,
    pub http: HttpConfig,
    pub timeouts: TimeoutConfig,
    pub message_log: MessageLogConfig,
    /// Other management nodes of the cluster. May include this node.
    pub peers: Vec<ManagementNode>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            node_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            http: HttpConfig::default(),
            timeouts: TimeoutConfig::default(),
            message_log: MessageLogConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CLOUDBUS_NODE_ID`: management node id (default: random)
    /// - `CLOUDBUS_NODE_IP`: address advertised to peers (default: 127.0.0.1)
    /// - `CLOUDBUS_HTTP_PORT`: bus port (default: 8989)
    /// - `CLOUDBUS_HTTP_CONTEXT_PATH`: path prefix of the bus endpoint (default: empty)
    /// - `CLOUDBUS_HTTP_ALWAYS`: deliver over HTTP even to this node (default: false)
    /// - `CLOUDBUS_MESSAGE_TIMEOUT`: default request timeout, e.g. `30m` (default: 30m)
    /// - `CLOUDBUS_HTTP_RETRY_TIMES`: attempts per HTTP delivery (default: 5)
    /// - `CLOUDBUS_HTTP_RETRY_INTERVAL`: wait between attempts (default: 2s)
    /// - `CLOUDBUS_MESSAGE_LOG`: comma separated message type names
    /// - `CLOUDBUS_MESSAGE_LOG_FILTER_ALL`: treat the names as a deny-list (default: true)
    /// - `CLOUDBUS_READ_API_LOG_OFF`: hide sync API calls and replies (default: true)
    /// - `CLOUDBUS_PEERS`: `id@ip[:port]` entries, comma separated
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`BusConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("CLOUDBUS_NODE_ID") {
            config.node_id = id;
        }
        if let Some(ip) = lookup("CLOUDBUS_NODE_IP") {
            config.node_ip = parse_var("CLOUDBUS_NODE_IP", &ip)?;
        }
        if let Some(port) = lookup("CLOUDBUS_HTTP_PORT") {
            config.http.port = parse_var("CLOUDBUS_HTTP_PORT", &port)?;
        }
        if let Some(path) = lookup("CLOUDBUS_HTTP_CONTEXT_PATH") {
            config.http.context_path = path;
        }
        if let Some(always) = lookup("CLOUDBUS_HTTP_ALWAYS") {
            config.http.always = parse_var("CLOUDBUS_HTTP_ALWAYS", &always)?;
        }
        if let Some(timeout) = lookup("CLOUDBUS_MESSAGE_TIMEOUT") {
            config.timeouts.default = parse_duration_var("CLOUDBUS_MESSAGE_TIMEOUT", &timeout)?;
        }
        if let Some(times) = lookup("CLOUDBUS_HTTP_RETRY_TIMES") {
            config.http.retry_times = parse_var("CLOUDBUS_HTTP_RETRY_TIMES", &times)?;
        }
        if let Some(interval) = lookup("CLOUDBUS_HTTP_RETRY_INTERVAL") {
            config.http.retry_interval = parse_duration_var("CLOUDBUS_HTTP_RETRY_INTERVAL", &interval)?;
        }
        if let Some(names) = lookup("CLOUDBUS_MESSAGE_LOG") {
            config.message_log.names = split_list(&names).map(str::to_string).collect();
        }
        if let Some(all) = lookup("CLOUDBUS_MESSAGE_LOG_FILTER_ALL") {
            config.message_log.filter_all = parse_var("CLOUDBUS_MESSAGE_LOG_FILTER_ALL", &all)?;
        }
        if let Some(off) = lookup("CLOUDBUS_READ_API_LOG_OFF") {
            config.message_log.read_api_log_off = parse_var("CLOUDBUS_READ_API_LOG_OFF", &off)?;
        }
        if let Some(peers) = lookup("CLOUDBUS_PEERS") {
            config.peers = split_list(&peers)
                .map(|entry| entry.parse().map_err(ConfigError::Invalid))
                .collect::<Result<_, _>>()?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id cannot be empty".into()));
        }

        if self.node_id.contains(crate::message::SERVICE_ID_SPLITTER) {
            return Err(ConfigError::Invalid(format!(
                "node_id cannot contain {}",
                crate::message::SERVICE_ID_SPLITTER
            )));
        }

        if self.timeouts.default.is_zero() {
            return Err(ConfigError::InvalidTimeout("default timeout cannot be 0".into()));
        }

        if let Some((name, _)) = self.timeouts.per_type.iter().find(|(_, t)| t.is_zero()) {
            return Err(ConfigError::InvalidTimeout(format!("timeout of {} cannot be 0", name)));
        }

        if self.http.retry_times == 0 {
            return Err(ConfigError::InvalidRetry("retry_times cannot be 0".into()));
        }

        if self.http.connect_timeout.is_zero() || self.http.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("http timeouts cannot be 0".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.uuid.as_str()) {
                return Err(ConfigError::DuplicatePeer(peer.uuid.clone()));
            }
        }

        Ok(())
    }

    /// This node as a cluster member.
    pub fn local_node(&self) -> ManagementNode {
        ManagementNode::new(self.node_id.clone(), self.node_ip).with_port(self.http.port)
    }

    /// Route the bus endpoint is served on, e.g. `/cloudbus` or `/ctx/cloudbus`.
    pub fn route_path(&self) -> String {
        let ctx = self.http.context_path.trim_matches('/');
        if ctx.is_empty() {
            HTTP_BASE_PATH.to_string()
        } else {
            format!("/{}{}", ctx, HTTP_BASE_PATH)
        }
    }

    /// Bus endpoint URL of `node`.
    pub fn url_for(&self, node: &ManagementNode) -> String {
        let port = node.port.unwrap_or(self.http.port);
        format!("http://{}{}", std::net::SocketAddr::new(node.ip, port), self.route_path())
    }
}

/// HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Port (default: 8989)
    pub port: u16,
    /// Path prefix in front of `/cloudbus`
    pub context_path: String,
    /// Deliver over HTTP even when the target is this node
    pub always: bool,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Attempts per delivery, first one included
    pub retry_times: u32,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8989,
            context_path: String::new(),
            always: false,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            retry_times: 5,
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Request timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Applied when neither the message nor its type sets a timeout
    #[serde(with = "humantime_serde")]
    pub default: Duration,
    /// Per message type overrides
    #[serde(with = "per_type_durations")]
    pub per_type: BTreeMap<String, Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30 * 60),
            per_type: BTreeMap::new(),
        }
    }
}

/// Which message dumps are written at TRACE level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageLogConfig {
    /// Message type names
    pub names: BTreeSet<String>,
    /// `true`: names are a deny-list. `false`: names are an allow-list.
    pub filter_all: bool,
    /// Hide sync API calls and API replies
    pub read_api_log_off: bool,
}

impl Default for MessageLogConfig {
    fn default() -> Self {
        Self {
            names: BTreeSet::new(),
            filter_all: true,
            read_api_log_off: true,
        }
    }
}

impl MessageLogConfig {
    pub fn should_log(&self, msg: &Message) -> bool {
        let read_api = matches!(msg.kind, MessageKind::ApiSyncCall { .. } | MessageKind::ApiReply { .. });
        if self.read_api_log_off && read_api {
            false
        } else if self.filter_all {
            !self.names.contains(&msg.type_name)
        } else {
            self.names.contains(&msg.type_name)
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("invalid retry policy: {0}")]
    InvalidRetry(String),
    /// Same node id listed twice
    #[error("duplicate peer {0}")]
    DuplicatePeer(String),
    /// Unparseable environment variable
    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: String, reason: String },
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidVar {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn parse_duration_var(name: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidVar {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Serde adapter for a map of humantime durations.
mod per_type_durations {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn serialize<S>(map: &BTreeMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        map.iter()
            .map(|(k, v)| (k.as_str(), humantime::format_duration(*v).to_string()))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| {
                humantime::parse_duration(&v)
                    .map(|d| (k, d))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http.port, 8989);
        assert_eq!(config.http.retry_times, 5);
        assert_eq!(config.http.retry_interval, Duration::from_secs(2));
        assert_eq!(config.timeouts.default, Duration::from_secs(1800));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = BusConfig::from_lookup(lookup(&[
            ("CLOUDBUS_NODE_ID", "mn-1"),
            ("CLOUDBUS_NODE_IP", "10.0.0.1"),
            ("CLOUDBUS_HTTP_PORT", "9000"),
            ("CLOUDBUS_MESSAGE_TIMEOUT", "90s"),
            ("CLOUDBUS_HTTP_RETRY_INTERVAL", "250ms"),
            ("CLOUDBUS_MESSAGE_LOG", "PingMsg, StartVmMsg"),
            ("CLOUDBUS_PEERS", "mn-2@10.0.0.2, mn-3@10.0.0.3:9100"),
        ]))
        .unwrap();

        assert_eq!(config.node_id, "mn-1");
        assert_eq!(config.node_ip.to_string(), "10.0.0.1");
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.timeouts.default, Duration::from_secs(90));
        assert_eq!(config.http.retry_interval, Duration::from_millis(250));
        assert!(config.message_log.names.contains("StartVmMsg"));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].port, Some(9100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = BusConfig::from_lookup(lookup(&[("CLOUDBUS_HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { ref name, .. } if name == "CLOUDBUS_HTTP_PORT"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BusConfig::default();
        config.timeouts.default = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout(_))));

        let mut config = BusConfig::default();
        config.http.retry_times = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRetry(_))));

        let mut config = BusConfig::default();
        config.node_id = " ".into();
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.peers = vec![ManagementNode::new("a", ip), ManagementNode::new("a", ip)];
        assert!(matches!(config.validate(), Err(ConfigError::DuplicatePeer(_))));
    }

    #[test]
    fn test_route_path_and_urls() {
        let mut config = BusConfig::default();
        assert_eq!(config.route_path(), "/cloudbus");

        config.http.context_path = "/zstack/".into();
        assert_eq!(config.route_path(), "/zstack/cloudbus");

        let node = ManagementNode::new("mn-2", "10.0.0.2".parse().unwrap());
        assert_eq!(config.url_for(&node), "http://10.0.0.2:8989/zstack/cloudbus");
        assert_eq!(config.url_for(&node.with_port(9100)), "http://10.0.0.2:9100/zstack/cloudbus");
    }

    #[test]
    fn test_message_log_filter() {
        let mut log = MessageLogConfig::default();
        log.names.insert("NoisyMsg".into());

        assert!(log.should_log(&Message::need_reply("PingMsg")));
        assert!(!log.should_log(&Message::need_reply("NoisyMsg")));
        assert!(!log.should_log(&Message::api_sync_call("APIQueryVmMsg")));

        log.filter_all = false;
        log.read_api_log_off = false;
        assert!(!log.should_log(&Message::need_reply("PingMsg")));
        assert!(log.should_log(&Message::need_reply("NoisyMsg")));
    }

    #[test]
    fn test_config_serde_durations() {
        let mut config = BusConfig::default();
        config.timeouts.per_type.insert("StartVmMsg".into(), Duration::from_secs(600));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: BusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timeouts.per_type["StartVmMsg"], Duration::from_secs(600));
        assert_eq!(parsed.http.retry_interval, config.http.retry_interval);

        let partial: BusConfig = serde_json::from_str(r#"{"node_id": "mn-9", "http": {"port": 7000}}"#).unwrap();
        assert_eq!(partial.node_id, "mn-9");
        assert_eq!(partial.http.port, 7000);
        assert_eq!(partial.http.retry_times, 5);
    }
}
