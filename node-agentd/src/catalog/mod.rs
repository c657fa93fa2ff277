//! In-process catalog used when the agent runs without a cluster.

pub mod db;

use std::collections::HashSet;
use parking_lot::Mutex;
use localstate::{Delegate, RpcError};
use shared::protocol::{DeregisterRequest, NodeServices, NodeSpecificRequest, RegisterRequest, HEALTH_PASSING};
use shared::types::{HealthCheck, Node};
use crate::catalog::db::CatalogDb;

/// Liveness check the catalog creates for every node it learns about
pub const SERF_CHECK_ID: &str = "serfHealth";

pub struct DevCatalog {
    db: Mutex<CatalogDb>,
    /// Tokens allowed to write. Empty allows every token.
    write_tokens: HashSet<String>,
}

impl DevCatalog {
    pub fn new(db: CatalogDb, write_tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            db: Mutex::new(db),
            write_tokens: write_tokens.into_iter().collect(),
        }
    }

    fn authorize(&self, token: &str) -> Result<(), RpcError> {
        if self.write_tokens.is_empty() || self.write_tokens.contains(token) {
            Ok(())
        } else {
            Err(RpcError::PermissionDenied)
        }
    }
}

fn unavailable(e: anyhow::Error) -> RpcError {
    RpcError::Unavailable(format!("{:#}", e))
}

impl Delegate for DevCatalog {
    fn lan_members(&self) -> usize {
        match self.db.lock().count_nodes() {
            Ok(count) => count.max(1),
            Err(e) => {
                tracing::warn!("Failed to count catalog nodes: {:#}", e);
                1
            }
        }
    }

    fn node_services(&self, req: &NodeSpecificRequest) -> Result<Option<NodeServices>, RpcError> {
        let db = self.db.lock();
        let node = db.get_node(&req.node).map_err(unavailable)?;
        let services = db.get_services(&req.node).map_err(unavailable)?;

        if node.is_none() && services.is_empty() {
            return Ok(None);
        }
        Ok(Some(NodeServices { node, services }))
    }

    fn node_checks(&self, req: &NodeSpecificRequest) -> Result<Vec<HealthCheck>, RpcError> {
        self.db.lock().get_checks(&req.node).map_err(unavailable)
    }

    fn register(&self, req: &RegisterRequest) -> Result<(), RpcError> {
        self.authorize(&req.token)?;
        if req.node.is_empty() {
            return Err(RpcError::Unavailable("Must provide node".to_string()));
        }

        let db = self.db.lock();
        let created = db
            .upsert_node(&Node {
                id: req.id.clone(),
                node: req.node.clone(),
                address: req.address.clone(),
                datacenter: req.datacenter.clone(),
                tagged_addresses: req.tagged_addresses.clone(),
                meta: req.node_meta.clone(),
            })
            .map_err(unavailable)?;

        if created {
            let serf = HealthCheck {
                node: req.node.clone(),
                check_id: SERF_CHECK_ID.to_string(),
                name: "Serf Health Status".to_string(),
                status: HEALTH_PASSING.to_string(),
                output: "Agent alive and reachable".to_string(),
                ..Default::default()
            };
            db.upsert_check(&req.node, &serf).map_err(unavailable)?;
            tracing::info!("Catalog learned node '{}'", req.node);
        }

        if let Some(service) = &req.service {
            db.upsert_service(&req.node, service).map_err(unavailable)?;
        }
        for check in req.all_checks() {
            db.upsert_check(&req.node, check).map_err(unavailable)?;
        }
        Ok(())
    }

    fn deregister(&self, req: &DeregisterRequest) -> Result<(), RpcError> {
        self.authorize(&req.token)?;
        let db = self.db.lock();

        if let Some(id) = &req.service_id {
            if !db.delete_service(&req.node, id).map_err(unavailable)? {
                return Err(RpcError::UnknownService(id.clone()));
            }
        }
        if let Some(id) = &req.check_id {
            if !db.delete_check(&req.node, id).map_err(unavailable)? {
                return Err(RpcError::UnknownCheck(id.clone()));
            }
        }
        Ok(())
    }
}
