use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Engine configuration, built once by the agent before the state is created.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default token for services and checks registered without their own
    pub acl_token: String,
    /// Token used for node-level reads and writes
    pub token_for_agent: String,
    /// Base interval between full syncs, before cluster-size scaling
    pub ae_interval: Duration,
    pub advertise_addr: String,
    /// Window for coalescing output-only check updates. Zero disables it.
    pub check_update_interval: Duration,
    pub datacenter: String,
    pub node_id: String,
    pub node_name: String,
    pub tagged_addresses: HashMap<String, String>,
    /// Check ids the catalog manages itself; never deregistered by a sync.
    pub system_checks: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acl_token: String::new(),
            token_for_agent: String::new(),
            ae_interval: Duration::from_secs(60),
            advertise_addr: String::new(),
            check_update_interval: Duration::from_secs(5 * 60),
            datacenter: "dc1".to_string(),
            node_id: String::new(),
            node_name: String::new(),
            tagged_addresses: HashMap::new(),
            system_checks: HashSet::new(),
        }
    }
}

impl Config {
    pub(crate) fn is_system_check(&self, id: &str) -> bool {
        self.system_checks.contains(id)
    }
}
