use std::collections::HashMap;
use serde::{Serialize, Deserialize};

/// Bookkeeping indexes assigned by the catalog on every write.
/// Never compared when deciding whether local and remote records agree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftIndex {
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// A service instance registered on a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeService {
    /// Instance id, unique per node. Defaults to `service` when empty.
    #[serde(default)]
    pub id: String,

    /// Logical service name, e.g. "web"
    pub service: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub meta: HashMap<String, String>,

    /// When set, the catalog owns the tag list and local tags are replaced
    /// by the remote ones during comparison.
    #[serde(default)]
    pub enable_tag_override: bool,

    #[serde(default)]
    pub raft_index: RaftIndex,
}

impl NodeService {
    /// Compares every field the node controls, ignoring catalog indexes.
    pub fn is_same(&self, other: &NodeService) -> bool {
        self.id == other.id
            && self.service == other.service
            && self.tags == other.tags
            && self.address == other.address
            && self.port == other.port
            && self.meta == other.meta
            && self.enable_tag_override == other.enable_tag_override
    }
}

/// A health check owned by a node, optionally tied to one of its services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Stamped with the local node name when added to local state.
    #[serde(default)]
    pub node: String,

    pub check_id: String,

    #[serde(default)]
    pub name: String,

    /// One of the `HEALTH_*` constants in `protocol`
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub notes: String,

    #[serde(default)]
    pub output: String,

    /// Empty for node-level checks
    #[serde(default)]
    pub service_id: String,

    #[serde(default)]
    pub service_name: String,

    #[serde(default)]
    pub raft_index: RaftIndex,
}

impl HealthCheck {
    /// Compares every field the node controls, ignoring catalog indexes.
    pub fn is_same(&self, other: &HealthCheck) -> bool {
        self.node == other.node
            && self.check_id == other.check_id
            && self.name == other.name
            && self.status == other.status
            && self.notes == other.notes
            && self.output == other.output
            && self.service_id == other.service_id
            && self.service_name == other.service_name
    }
}

/// Node-level identity as recorded by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub tagged_addresses: HashMap<String, String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}
