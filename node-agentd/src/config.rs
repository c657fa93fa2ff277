use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use sha2::{Sha256, Digest};
use anyhow::{Context, Result};
use crate::catalog::SERF_CHECK_ID;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Defaults to the system hostname
    pub node_name: Option<String>,
    /// Defaults to an id derived from the node name
    pub node_id: Option<String>,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
    #[serde(default)]
    pub advertise_addr: String,
    #[serde(default)]
    pub tagged_addresses: HashMap<String, String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// Default token for services and checks
    #[serde(default)]
    pub acl_token: String,
    /// Token for node-level catalog access; falls back to `acl_token`
    pub acl_agent_token: Option<String>,
    #[serde(default = "default_ae_interval")]
    pub ae_interval_secs: u64,
    #[serde(default = "default_check_update_interval")]
    pub check_update_interval_secs: u64,
    #[serde(default = "default_system_checks")]
    pub system_checks: Vec<String>,
    #[serde(default)]
    pub discard_check_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Tokens allowed to write to the catalog. Empty disables the check.
    #[serde(default)]
    pub write_tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

fn default_ae_interval() -> u64 {
    60
}

fn default_check_update_interval() -> u64 {
    300
}

fn default_system_checks() -> Vec<String> {
    vec![SERF_CHECK_ID.to_string()]
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/node-agent/catalog.db")
}

fn default_listen() -> String {
    "127.0.0.1:8500".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            node_id: None,
            datacenter: default_datacenter(),
            advertise_addr: String::new(),
            tagged_addresses: HashMap::new(),
            meta: HashMap::new(),
            acl_token: String::new(),
            acl_agent_token: None,
            ae_interval_secs: default_ae_interval(),
            check_update_interval_secs: default_check_update_interval(),
            system_checks: default_system_checks(),
            discard_check_output: false,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            write_tokens: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

impl AgentConfig {
    /// Resolves defaults that depend on the host and builds the engine config.
    pub fn to_state_config(&self) -> Result<localstate::Config> {
        let node_name = match &self.node_name {
            Some(name) => name.clone(),
            None => hostname::get()
                .context("Failed to get system hostname")?
                .to_string_lossy()
                .to_string(),
        };
        let node_id = self
            .node_id
            .clone()
            .unwrap_or_else(|| node_id_from_name(&node_name));

        Ok(localstate::Config {
            acl_token: self.acl_token.clone(),
            token_for_agent: self
                .acl_agent_token
                .clone()
                .unwrap_or_else(|| self.acl_token.clone()),
            ae_interval: Duration::from_secs(self.ae_interval_secs),
            advertise_addr: self.advertise_addr.clone(),
            check_update_interval: Duration::from_secs(self.check_update_interval_secs),
            datacenter: self.datacenter.clone(),
            node_id,
            node_name,
            tagged_addresses: self.tagged_addresses.clone(),
            system_checks: self.system_checks.iter().cloned().collect(),
        })
    }
}

/// Stable UUID-shaped node id derived from the node name
pub fn node_id_from_name(node_name: &str) -> String {
    let hash = hex::encode(Sha256::digest(node_name.as_bytes()));
    format!(
        "{}-{}-{}-{}-{}",
        &hash[0..8],
        &hash[8..12],
        &hash[12..16],
        &hash[16..20],
        &hash[20..32]
    )
}
