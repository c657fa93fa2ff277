use std::collections::HashMap;
use serde::{Serialize, Deserialize};
use crate::types::{HealthCheck, Node, NodeService};

/// Health check statuses understood by the catalog
pub const HEALTH_PASSING: &str = "passing";
pub const HEALTH_WARNING: &str = "warning";
pub const HEALTH_CRITICAL: &str = "critical";
pub const HEALTH_MAINT: &str = "maintenance";

/// Local agent API path prefix
pub const API_PREFIX: &str = "/v1/agent";

/// Read request scoped to a single node of the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpecificRequest {
    pub datacenter: String,
    pub node: String,
    #[serde(default)]
    pub token: String,
}

/// Everything the catalog knows about one node's services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeServices {
    pub node: Option<Node>,
    #[serde(default)]
    pub services: HashMap<String, NodeService>,
}

/// Catalog write that upserts node info and, optionally, a service and checks.
///
/// `check` is the single-check form kept for older catalogs; `checks` is used
/// for zero or several checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub datacenter: String,
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub tagged_addresses: HashMap<String, String>,
    #[serde(default)]
    pub node_meta: HashMap<String, String>,
    pub service: Option<NodeService>,
    pub check: Option<HealthCheck>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default)]
    pub token: String,
}

impl RegisterRequest {
    /// All checks carried by the request regardless of which field holds them
    pub fn all_checks(&self) -> impl Iterator<Item = &HealthCheck> {
        self.check.iter().chain(self.checks.iter())
    }
}

/// Catalog write that removes a service or a check from a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub datacenter: String,
    pub node: String,
    pub service_id: Option<String>,
    pub check_id: Option<String>,
    #[serde(default)]
    pub token: String,
}
