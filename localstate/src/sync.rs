use std::collections::HashMap;
use shared::protocol::{DeregisterRequest, NodeSpecificRequest, RegisterRequest};
use shared::types::HealthCheck;
use crate::error::{RpcError, StateError};
use crate::state::{CheckState, LocalState, Records, ServiceState};

impl LocalState {
    /// Reads this node's services and checks from the catalog and marks
    /// every local record that disagrees as out of sync.
    ///
    /// Records the catalog has but we don't get a tombstone so the next
    /// push pass deregisters them. Nothing is touched if either read fails.
    pub fn set_sync_state(&self) -> Result<(), StateError> {
        let config = &self.inner.config;
        let req = NodeSpecificRequest {
            datacenter: config.datacenter.clone(),
            node: config.node_name.clone(),
            token: config.token_for_agent.clone(),
        };

        let node_services = self.inner.delegate.node_services(&req)?;
        let remote_checks = self.inner.delegate.node_checks(&req)?;

        let mut records = self.inner.records.write();

        let node_matches = node_services
            .as_ref()
            .and_then(|ns| ns.node.as_ref())
            .is_some_and(|node| {
                node.id == config.node_id
                    && node.tagged_addresses == config.tagged_addresses
                    && node.meta == records.metadata
            });
        if !node_matches {
            records.node_info_in_sync = false;
        }

        let remote_services = node_services.map(|ns| ns.services).unwrap_or_default();

        for (id, s) in records.services.iter_mut() {
            if !remote_services.contains_key(id) {
                s.in_sync = false;
            }
        }

        for (id, remote) in remote_services {
            let Some(s) = records.services.get_mut(&id) else {
                records.services.insert(id, ServiceState::default());
                continue;
            };
            // pending delete, stays out of sync
            let Some(local) = s.service.as_mut() else {
                continue;
            };

            if local.enable_tag_override {
                local.tags = remote.tags.clone();
            }
            s.in_sync = local.is_same(&remote);
        }

        let remote_checks: HashMap<String, HealthCheck> = remote_checks
            .into_iter()
            .map(|check| (check.check_id.clone(), check))
            .collect();

        for (id, c) in records.checks.iter_mut() {
            if !remote_checks.contains_key(id) {
                c.in_sync = false;
            }
        }

        let coalescing = !config.check_update_interval.is_zero();
        for (id, remote) in remote_checks {
            let deferred = records.deferred.contains_key(&id);
            let Some(c) = records.checks.get_mut(&id) else {
                if !config.is_system_check(&id) {
                    records.checks.insert(id, CheckState::default());
                }
                continue;
            };
            let Some(local) = c.check.as_ref() else {
                continue;
            };

            c.in_sync = if coalescing && deferred {
                // the pending write-back will carry the output
                let mut local = local.clone();
                let mut remote = remote;
                local.output.clear();
                remote.output.clear();
                local.is_same(&remote)
            } else {
                local.is_same(&remote)
            };
        }

        Ok(())
    }

    /// Pushes every out-of-sync or deleted record to the catalog.
    ///
    /// Services go first, then checks, then node info if no earlier write
    /// already carried it. The first unclassified error aborts the pass;
    /// writes that already succeeded are kept.
    pub fn sync_changes(&self) -> Result<(), StateError> {
        let mut records = self.inner.records.write();

        let mut service_ids: Vec<String> = records.services.keys().cloned().collect();
        service_ids.sort();
        for id in service_ids {
            let Some(s) = records.services.get(&id) else {
                continue;
            };
            if s.service.is_none() {
                if s.in_sync {
                    tracing::debug!("Service '{}' deletion blocked by ACLs, skipping", id);
                } else {
                    self.delete_service(&mut records, &id)?;
                }
            } else if !s.in_sync {
                self.sync_service(&mut records, &id)?;
            } else {
                tracing::debug!("Service '{}' in sync", id);
            }
        }

        let mut check_ids: Vec<String> = records.checks.keys().cloned().collect();
        check_ids.sort();
        for id in check_ids {
            let Some(c) = records.checks.get(&id) else {
                continue;
            };
            if c.check.is_none() {
                if c.in_sync {
                    tracing::debug!("Check '{}' deletion blocked by ACLs, skipping", id);
                } else {
                    self.delete_check(&mut records, &id)?;
                }
            } else if !c.in_sync {
                records.cancel_deferred(&id);
                self.sync_check(&mut records, &id)?;
            } else {
                tracing::debug!("Check '{}' in sync", id);
            }
        }

        if !records.node_info_in_sync {
            self.sync_node_info(&mut records)?;
        } else {
            tracing::debug!("Node info in sync");
        }

        Ok(())
    }

    /// One full diff followed by one push pass.
    pub fn sync_full(&self) -> Result<(), StateError> {
        self.set_sync_state()?;
        self.sync_changes()
    }

    fn register_request(&self, records: &Records, token: String) -> RegisterRequest {
        let config = &self.inner.config;
        RegisterRequest {
            datacenter: config.datacenter.clone(),
            id: config.node_id.clone(),
            node: config.node_name.clone(),
            address: config.advertise_addr.clone(),
            tagged_addresses: config.tagged_addresses.clone(),
            node_meta: records.metadata.clone(),
            token,
            ..Default::default()
        }
    }

    fn deregister_request(&self, token: String) -> DeregisterRequest {
        let config = &self.inner.config;
        DeregisterRequest {
            datacenter: config.datacenter.clone(),
            node: config.node_name.clone(),
            token,
            ..Default::default()
        }
    }

    fn delete_service(&self, records: &mut Records, id: &str) -> Result<(), StateError> {
        if id.is_empty() {
            return Err(StateError::MissingServiceId);
        }

        let mut req = self.deregister_request(self.inner.service_token(records, id));
        req.service_id = Some(id.to_string());

        match self.inner.delegate.deregister(&req) {
            Ok(()) | Err(RpcError::UnknownService(_)) => {
                records.services.remove(id);
                tracing::info!("Deregistered service '{}'", id);
                Ok(())
            }
            Err(RpcError::PermissionDenied) => {
                if let Some(s) = records.services.get_mut(id) {
                    s.in_sync = true;
                }
                tracing::warn!("Service '{}' deregistration blocked by ACLs", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_check(&self, records: &mut Records, id: &str) -> Result<(), StateError> {
        if id.is_empty() {
            return Err(StateError::MissingCheckId);
        }

        let mut req = self.deregister_request(self.inner.check_token(records, id));
        req.check_id = Some(id.to_string());

        match self.inner.delegate.deregister(&req) {
            Ok(()) | Err(RpcError::UnknownCheck(_)) => {
                records.checks.remove(id);
                records.cancel_deferred(id);
                tracing::info!("Deregistered check '{}'", id);
                Ok(())
            }
            Err(RpcError::PermissionDenied) => {
                if let Some(c) = records.checks.get_mut(id) {
                    c.in_sync = true;
                }
                tracing::warn!("Check '{}' deregistration blocked by ACLs", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Registers a service, carrying along its out-of-sync checks that use
    /// the same token. Checks with another token are registered on their
    /// own so they don't borrow the service's privileges.
    fn sync_service(&self, records: &mut Records, id: &str) -> Result<(), StateError> {
        let Some(service) = records.services.get(id).and_then(|s| s.service.clone()) else {
            return Ok(());
        };
        let token = self.inner.service_token(records, id);

        let mut piggyback: Vec<String> = {
            let view: &Records = records;
            view.checks
                .iter()
                .filter(|(_, c)| !c.in_sync)
                .filter(|(_, c)| c.check.as_ref().is_some_and(|check| check.service_id == id))
                .filter(|(check_id, _)| self.inner.check_token(view, check_id) == token)
                .map(|(check_id, _)| check_id.clone())
                .collect()
        };
        piggyback.sort();

        let mut checks: Vec<HealthCheck> = Vec::with_capacity(piggyback.len());
        for check_id in &piggyback {
            records.cancel_deferred(check_id);
            if let Some(check) = records.checks.get(check_id).and_then(|c| c.check.clone()) {
                checks.push(check);
            }
        }

        let mut req = self.register_request(records, token);
        req.service = Some(service);
        // single-check field for catalogs that predate `checks`
        if checks.len() == 1 {
            req.check = checks.pop();
        } else {
            req.checks = checks;
        }

        let outcome = self.inner.delegate.register(&req);
        let mark_synced = |records: &mut Records| {
            if let Some(s) = records.services.get_mut(id) {
                s.in_sync = true;
            }
            for check_id in &piggyback {
                if let Some(c) = records.checks.get_mut(check_id) {
                    c.in_sync = true;
                }
            }
        };

        match outcome {
            Ok(()) => {
                mark_synced(&mut *records);
                // every register call also writes node info
                records.node_info_in_sync = true;
                tracing::info!("Synced service '{}'", id);
                Ok(())
            }
            Err(RpcError::PermissionDenied) => {
                mark_synced(&mut *records);
                tracing::warn!("Service '{}' registration blocked by ACLs", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sync_check(&self, records: &mut Records, id: &str) -> Result<(), StateError> {
        let Some(check) = records.checks.get(id).and_then(|c| c.check.clone()) else {
            return Ok(());
        };
        let service = if check.service_id.is_empty() {
            None
        } else {
            records
                .services
                .get(&check.service_id)
                .and_then(|s| s.service.clone())
        };

        let mut req = self.register_request(records, self.inner.check_token(records, id));
        req.service = service;
        req.check = Some(check);

        match self.inner.delegate.register(&req) {
            Ok(()) => {
                if let Some(c) = records.checks.get_mut(id) {
                    c.in_sync = true;
                }
                records.node_info_in_sync = true;
                tracing::info!("Synced check '{}'", id);
                Ok(())
            }
            Err(RpcError::PermissionDenied) => {
                if let Some(c) = records.checks.get_mut(id) {
                    c.in_sync = true;
                }
                tracing::warn!("Check '{}' registration blocked by ACLs", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sync_node_info(&self, records: &mut Records) -> Result<(), StateError> {
        let req = self.register_request(records, self.inner.config.token_for_agent.clone());

        match self.inner.delegate.register(&req) {
            Ok(()) => {
                records.node_info_in_sync = true;
                tracing::info!("Synced node info");
                Ok(())
            }
            Err(RpcError::PermissionDenied) => {
                records.node_info_in_sync = true;
                tracing::warn!("Node info update blocked by ACLs");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
