use std::collections::HashMap;
use parking_lot::Mutex;
use shared::protocol::{DeregisterRequest, NodeServices, NodeSpecificRequest, RegisterRequest};
use shared::types::{HealthCheck, Node, NodeService};
use crate::delegate::Delegate;
use crate::error::RpcError;

/// In-memory catalog for one node that records every write.
#[derive(Default)]
pub(crate) struct MockCatalog {
    pub(crate) inner: Mutex<MockInner>,
}

#[derive(Default)]
pub(crate) struct MockInner {
    pub(crate) members: usize,
    pub(crate) node: Option<Node>,
    pub(crate) services: HashMap<String, NodeService>,
    pub(crate) checks: HashMap<String, HealthCheck>,
    pub(crate) registers: Vec<RegisterRequest>,
    pub(crate) deregisters: Vec<DeregisterRequest>,
    /// Returned by the next reads until `failing_reads` drops to zero
    pub(crate) failing_reads: usize,
    pub(crate) register_error: Option<RpcError>,
    pub(crate) deregister_error: Option<RpcError>,
}

impl MockCatalog {
    pub(crate) fn registers(&self) -> Vec<RegisterRequest> {
        self.inner.lock().registers.clone()
    }

    pub(crate) fn deregisters(&self) -> Vec<DeregisterRequest> {
        self.inner.lock().deregisters.clone()
    }

    pub(crate) fn clear_calls(&self) {
        let mut inner = self.inner.lock();
        inner.registers.clear();
        inner.deregisters.clear();
    }

    fn read_failure(inner: &mut MockInner) -> Result<(), RpcError> {
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(RpcError::Unavailable("no cluster leader".to_string()));
        }
        Ok(())
    }
}

impl Delegate for MockCatalog {
    fn lan_members(&self) -> usize {
        self.inner.lock().members
    }

    fn node_services(&self, _req: &NodeSpecificRequest) -> Result<Option<NodeServices>, RpcError> {
        let mut inner = self.inner.lock();
        Self::read_failure(&mut inner)?;
        if inner.node.is_none() && inner.services.is_empty() {
            return Ok(None);
        }
        Ok(Some(NodeServices {
            node: inner.node.clone(),
            services: inner.services.clone(),
        }))
    }

    fn node_checks(&self, _req: &NodeSpecificRequest) -> Result<Vec<HealthCheck>, RpcError> {
        let mut inner = self.inner.lock();
        Self::read_failure(&mut inner)?;
        Ok(inner.checks.values().cloned().collect())
    }

    fn register(&self, req: &RegisterRequest) -> Result<(), RpcError> {
        let mut inner = self.inner.lock();
        inner.registers.push(req.clone());
        if let Some(err) = inner.register_error.clone() {
            return Err(err);
        }

        inner.node = Some(Node {
            id: req.id.clone(),
            node: req.node.clone(),
            address: req.address.clone(),
            datacenter: req.datacenter.clone(),
            tagged_addresses: req.tagged_addresses.clone(),
            meta: req.node_meta.clone(),
        });
        if let Some(service) = &req.service {
            inner.services.insert(service.id.clone(), service.clone());
        }
        let checks: Vec<HealthCheck> = req.all_checks().cloned().collect();
        for check in checks {
            inner.checks.insert(check.check_id.clone(), check);
        }
        Ok(())
    }

    fn deregister(&self, req: &DeregisterRequest) -> Result<(), RpcError> {
        let mut inner = self.inner.lock();
        inner.deregisters.push(req.clone());
        if let Some(err) = inner.deregister_error.clone() {
            return Err(err);
        }

        if let Some(id) = &req.service_id {
            if inner.services.remove(id).is_none() {
                return Err(RpcError::UnknownService(id.clone()));
            }
        }
        if let Some(id) = &req.check_id {
            if inner.checks.remove(id).is_none() {
                return Err(RpcError::UnknownCheck(id.clone()));
            }
        }
        Ok(())
    }
}
