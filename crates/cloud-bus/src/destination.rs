//! Cluster membership and resource placement.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::info;

/// Virtual points per node on the hash ring.
const VIRTUAL_NODES: usize = 100;

/// One management node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagementNode {
    pub uuid: String,
    pub ip: IpAddr,
    /// Bus port when it differs from the cluster-wide one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ManagementNode {
    pub fn new(uuid: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            uuid: uuid.into(),
            ip,
            port: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

impl FromStr for ManagementNode {
    type Err = String;

    /// Parses `uuid@ip` or `uuid@ip:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (uuid, addr) = s
            .split_once('@')
            .ok_or_else(|| format!("expected uuid@ip[:port], got {}", s))?;
        if uuid.is_empty() {
            return Err(format!("missing node uuid in {}", s));
        }
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            return Ok(ManagementNode::new(uuid, sock.ip()).with_port(sock.port()));
        }
        let ip = addr.parse::<IpAddr>().map_err(|e| format!("bad address in {}: {}", s, e))?;
        Ok(ManagementNode::new(uuid, ip))
    }
}

/// Resolves service ids to nodes.
pub trait DestinationResolver: Send + Sync {
    /// Node that owns `resource_uuid`.
    fn node_for_resource(&self, resource_uuid: &str) -> Option<String>;

    fn node_info(&self, node_uuid: &str) -> Option<ManagementNode>;

    fn all_nodes(&self) -> Vec<ManagementNode>;
}

#[derive(Default)]
struct Ring {
    nodes: BTreeMap<String, ManagementNode>,
    points: BTreeMap<u64, String>,
}

fn point(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl Ring {
    fn add(&mut self, node: ManagementNode) {
        for replica in 0..VIRTUAL_NODES {
            self.points.insert(point(&format!("{}#{}", node.uuid, replica)), node.uuid.clone());
        }
        self.nodes.insert(node.uuid.clone(), node);
    }

    fn remove(&mut self, uuid: &str) -> Option<ManagementNode> {
        let node = self.nodes.remove(uuid)?;
        self.points.retain(|_, owner| owner != uuid);
        Some(node)
    }

    fn lookup(&self, key: &str) -> Option<&String> {
        let h = point(key);
        self.points
            .range(h..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, owner)| owner)
    }
}

/// In-memory node table with consistent-hash placement.
#[derive(Default)]
pub struct StaticDestinationMaker {
    ring: RwLock<Ring>,
}

impl StaticDestinationMaker {
    pub fn new(nodes: impl IntoIterator<Item = ManagementNode>) -> Self {
        let maker = Self::default();
        for node in nodes {
            maker.join(node);
        }
        maker
    }

    /// Adds or replaces a node.
    pub fn join(&self, node: ManagementNode) {
        let mut ring = self.ring.write();
        ring.remove(&node.uuid);
        info!(node = %node.uuid, ip = %node.ip, "management node joined");
        ring.add(node);
    }

    pub fn leave(&self, uuid: &str) -> Option<ManagementNode> {
        let removed = self.ring.write().remove(uuid);
        if removed.is_some() {
            info!(node = %uuid, "management node left");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.ring.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DestinationResolver for StaticDestinationMaker {
    fn node_for_resource(&self, resource_uuid: &str) -> Option<String> {
        self.ring.read().lookup(resource_uuid).cloned()
    }

    fn node_info(&self, node_uuid: &str) -> Option<ManagementNode> {
        self.ring.read().nodes.get(node_uuid).cloned()
    }

    fn all_nodes(&self) -> Vec<ManagementNode> {
        self.ring.read().nodes.values().cloned().collect()
    }
}
