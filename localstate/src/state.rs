use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use shared::protocol::HEALTH_CRITICAL;
use shared::types::{HealthCheck, NodeService};
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use crate::config::Config;
use crate::delegate::Delegate;
use crate::error::StateError;
use crate::scale::random_stagger;

/// Local record of a service. `service == None` marks a pending deletion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceState {
    pub service: Option<NodeService>,
    pub in_sync: bool,
    pub token: String,
}

/// Local record of a check. `check == None` marks a pending deletion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckState {
    pub check: Option<HealthCheck>,
    pub in_sync: bool,
    pub token: String,
    /// When the check last went critical; `None` while not critical
    pub critical_since: Option<DateTime<Utc>>,
}

impl CheckState {
    pub fn is_critical(&self) -> bool {
        self.critical_since.is_some()
    }

    /// How long the check has been critical, if it is
    pub fn critical_for(&self) -> Option<chrono::Duration> {
        self.critical_since.map(|since| Utc::now() - since)
    }
}

/// Pending write-back of a check whose output changed but status did not.
pub(crate) struct DeferredCheck {
    seq: u64,
    timer: AbortHandle,
}

/// Everything guarded by the state lock.
#[derive(Default)]
pub(crate) struct Records {
    pub(crate) services: HashMap<String, ServiceState>,
    pub(crate) checks: HashMap<String, CheckState>,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) deferred: HashMap<String, DeferredCheck>,
    /// Whether the catalog has our node identity and metadata
    pub(crate) node_info_in_sync: bool,
    next_timer_seq: u64,
    watchers: Vec<mpsc::Sender<()>>,
    /// Source service id -> alias check id -> waiter
    check_aliases: HashMap<String, HashMap<String, mpsc::Sender<()>>>,
}

impl Records {
    /// Stops a pending output write-back. Returns true if one was pending.
    pub(crate) fn cancel_deferred(&mut self, id: &str) -> bool {
        match self.deferred.remove(id) {
            Some(deferred) => {
                deferred.timer.abort();
                true
            }
            None => false,
        }
    }

    fn broadcast(&mut self) {
        self.watchers.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Wakes the alias checks that mirror `service_id`. Never blocks.
    fn notify_if_aliased(&self, service_id: &str) {
        if let Some(aliases) = self.check_aliases.get(service_id) {
            for tx in aliases.values() {
                let _ = tx.try_send(());
            }
        }
    }

    fn is_live_service(&self, id: &str) -> bool {
        self.services.get(id).is_some_and(|s| s.service.is_some())
    }

    /// A check may only name a service that is registered locally.
    /// `pending` is a service about to be added in the same write.
    fn ensure_check_service(&self, check: &HealthCheck, pending: Option<&str>) -> Result<(), StateError> {
        let service_id = check.service_id.as_str();
        if service_id.is_empty() || pending == Some(service_id) || self.is_live_service(service_id) {
            return Ok(());
        }
        Err(StateError::CheckServiceNotFound {
            check_id: check.check_id.clone(),
            service_id: service_id.to_string(),
        })
    }
}

impl Drop for Records {
    fn drop(&mut self) {
        for (_, deferred) in self.deferred.drain() {
            deferred.timer.abort();
        }
    }
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) delegate: Arc<dyn Delegate>,
    pub(crate) records: RwLock<Records>,
    paused: AtomicI64,
    discard_check_output: AtomicBool,
    /// Local state changed and needs a push pass. Holds at most one permit.
    pub(crate) trigger: Notify,
    /// A catalog server became reachable
    pub(crate) server_up: Notify,
}

impl Inner {
    pub(crate) fn change_made(&self) {
        self.trigger.notify_one();
    }

    pub(crate) fn service_token(&self, records: &Records, id: &str) -> String {
        records
            .services
            .get(id)
            .map(|s| s.token.as_str())
            .filter(|token| !token.is_empty())
            .unwrap_or(&self.config.acl_token)
            .to_string()
    }

    pub(crate) fn check_token(&self, records: &Records, id: &str) -> String {
        records
            .checks
            .get(id)
            .map(|c| c.token.as_str())
            .filter(|token| !token.is_empty())
            .unwrap_or(&self.config.acl_token)
            .to_string()
    }

    fn fire_deferred(&self, id: &str, seq: u64) {
        let mut records = self.records.write();
        // superseded or cancelled while waiting for the lock
        if records.deferred.get(id).map(|d| d.seq) != Some(seq) {
            return;
        }
        records.deferred.remove(id);

        if let Some(c) = records.checks.get_mut(id) {
            if c.check.is_some() {
                c.in_sync = false;
                self.change_made();
            }
        }
    }
}

/// Handle to the node's local state. Cheap to clone; all clones share the
/// same records.
#[derive(Clone)]
pub struct LocalState {
    pub(crate) inner: Arc<Inner>,
}

impl LocalState {
    pub fn new(config: Config, delegate: Arc<dyn Delegate>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                delegate,
                records: RwLock::new(Records::default()),
                paused: AtomicI64::new(0),
                discard_check_output: AtomicBool::new(false),
                trigger: Notify::new(),
                server_up: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Signals that a catalog server is reachable again, shortening the
    /// wait of a failing full sync.
    pub fn server_up(&self) {
        self.inner.server_up.notify_one();
    }

    /// Suspends push passes triggered by local changes. Nests.
    pub fn pause(&self) {
        self.inner.paused.fetch_add(1, Ordering::SeqCst);
    }

    /// Undoes one `pause` and triggers a push pass.
    ///
    /// # Panics
    ///
    /// When called more often than `pause`.
    pub fn resume(&self) {
        let previous = self.inner.paused.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            panic!("unbalanced LocalState::resume() detected");
        }
        self.inner.change_made();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst) > 0
    }

    /// Drop check output on every update from now on
    pub fn set_discard_check_output(&self, discard: bool) {
        self.inner.discard_check_output.store(discard, Ordering::SeqCst);
    }

    /// Registers a watcher notified on every service or check add/remove.
    /// Sends never block; a full channel already carries a pending notice.
    pub fn notify(&self, tx: mpsc::Sender<()>) {
        self.inner.records.write().watchers.push(tx);
    }

    pub fn stop_notify(&self, tx: &mpsc::Sender<()>) {
        self.inner.records.write().watchers.retain(|w| !w.same_channel(tx));
    }

    /// Registers alias check `check_id`, which mirrors the health of
    /// `src_service_id`. `tx` receives a notice whenever that service or
    /// one of its checks is added, removed or changes status, so the alias
    /// can re-evaluate without asking the catalog. Give `tx` a buffer of
    /// at least one; a full buffer already carries a pending notice.
    pub fn add_alias_check(&self, check_id: &str, src_service_id: &str, tx: mpsc::Sender<()>) {
        self.inner
            .records
            .write()
            .check_aliases
            .entry(src_service_id.to_string())
            .or_default()
            .insert(check_id.to_string(), tx);
    }

    pub fn remove_alias_check(&self, check_id: &str, src_service_id: &str) {
        let mut records = self.inner.records.write();
        if let Some(aliases) = records.check_aliases.get_mut(src_service_id) {
            aliases.remove(check_id);
            if aliases.is_empty() {
                records.check_aliases.remove(src_service_id);
            }
        }
    }

    /// Token for a service, falling back to the agent default
    pub fn service_token(&self, id: &str) -> String {
        let records = self.inner.records.read();
        self.inner.service_token(&records, id)
    }

    /// Token for a check, falling back to the agent default
    pub fn check_token(&self, id: &str) -> String {
        let records = self.inner.records.read();
        self.inner.check_token(&records, id)
    }

    /// Adds or replaces a service. The agent keeps trying to register it
    /// until it is removed.
    pub fn add_service(&self, service: NodeService, token: &str) {
        let mut records = self.inner.records.write();
        self.add_service_locked(&mut records, service, token);
        records.broadcast();
        self.inner.change_made();
    }

    fn add_service_locked(&self, records: &mut Records, mut service: NodeService, token: &str) {
        if service.id.is_empty() && !service.service.is_empty() {
            service.id = service.service.clone();
        }

        let id = service.id.clone();
        let previous = records.services.insert(
            id.clone(),
            ServiceState {
                service: Some(service),
                in_sync: false,
                token: token.to_string(),
            },
        );
        // aliases only care about the service appearing, not about updates
        if previous.map_or(true, |p| p.service.is_none()) {
            records.notify_if_aliased(&id);
        }
    }

    /// Adds a service and its checks under a single lock acquisition.
    /// Nothing is added if a check names some other unknown service.
    pub fn add_service_with_checks(
        &self,
        service: NodeService,
        checks: Vec<HealthCheck>,
        token: &str,
    ) -> Result<(), StateError> {
        let service_id = if service.id.is_empty() { &service.service } else { &service.id };

        let mut records = self.inner.records.write();
        for check in &checks {
            records.ensure_check_service(check, Some(service_id))?;
        }

        self.add_service_locked(&mut records, service, token);
        for check in checks {
            self.add_check_locked(&mut records, check, token);
        }
        records.broadcast();
        self.inner.change_made();
        Ok(())
    }

    /// Marks a service for deregistration. The record stays until the
    /// catalog confirms the delete.
    pub fn remove_service(&self, id: &str) -> Result<(), StateError> {
        let mut records = self.inner.records.write();
        self.remove_service_locked(&mut records, id)?;
        records.broadcast();
        self.inner.change_made();
        Ok(())
    }

    fn remove_service_locked(&self, records: &mut Records, id: &str) -> Result<(), StateError> {
        match records.services.get_mut(id) {
            Some(s) if s.service.is_some() => {
                // keep the token around for the deregistration
                s.service = None;
                s.in_sync = false;
                records.notify_if_aliased(id);
                Ok(())
            }
            _ => Err(StateError::ServiceNotFound(id.to_string())),
        }
    }

    /// Marks a service and the given checks for deregistration.
    pub fn remove_service_with_checks(&self, id: &str, check_ids: &[String]) -> Result<(), StateError> {
        let mut records = self.inner.records.write();
        self.remove_service_locked(&mut records, id)?;
        for check_id in check_ids {
            Self::remove_check_locked(&mut records, check_id);
        }
        records.broadcast();
        self.inner.change_made();
        Ok(())
    }

    /// Live service by id
    pub fn service(&self, id: &str) -> Option<ServiceState> {
        let records = self.inner.records.read();
        records.services.get(id).filter(|s| s.service.is_some()).cloned()
    }

    /// All live services
    pub fn services(&self) -> HashMap<String, ServiceState> {
        let records = self.inner.records.read();
        records
            .services
            .iter()
            .filter(|(_, s)| s.service.is_some())
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    pub fn service_exists(&self, id: &str) -> bool {
        self.inner.records.read().is_live_service(id)
    }

    /// Live service instances registered under the service name `name`
    pub fn services_by_name(&self, name: &str) -> Vec<NodeService> {
        let records = self.inner.records.read();
        records
            .services
            .values()
            .filter_map(|s| s.service.as_ref())
            .filter(|service| service.service == name)
            .cloned()
            .collect()
    }

    /// Adds or replaces a check, stamping it with the local node name.
    /// A check bound to a service needs that service registered first.
    pub fn add_check(&self, check: HealthCheck, token: &str) -> Result<(), StateError> {
        let mut records = self.inner.records.write();
        records.ensure_check_service(&check, None)?;
        self.add_check_locked(&mut records, check, token);
        records.broadcast();
        self.inner.change_made();
        Ok(())
    }

    fn add_check_locked(&self, records: &mut Records, mut check: HealthCheck, token: &str) {
        check.node = self.inner.config.node_name.clone();
        let critical_since = (check.status == HEALTH_CRITICAL).then(Utc::now);

        records.notify_if_aliased(&check.service_id);
        records.checks.insert(
            check.check_id.clone(),
            CheckState {
                check: Some(check),
                in_sync: false,
                token: token.to_string(),
                critical_since,
            },
        );
    }

    /// Marks a check for deregistration. Unknown ids are ignored.
    pub fn remove_check(&self, id: &str) {
        let mut records = self.inner.records.write();
        if Self::remove_check_locked(&mut records, id) {
            records.broadcast();
            self.inner.change_made();
        }
    }

    fn remove_check_locked(records: &mut Records, id: &str) -> bool {
        let Some(c) = records.checks.get_mut(id) else {
            return false;
        };
        let Some(check) = c.check.take() else {
            return false;
        };

        c.in_sync = false;
        c.critical_since = None;
        records.cancel_deferred(id);
        records.notify_if_aliased(&check.service_id);
        true
    }

    /// Records the latest result of a check.
    ///
    /// Status changes are pushed right away. Output-only changes are held
    /// back for a while when a check update interval is configured, so a
    /// chatty check does not turn into a stream of catalog writes.
    pub fn update_check(&self, id: &str, status: &str, output: &str) {
        let output = if self.inner.discard_check_output.load(Ordering::SeqCst) {
            ""
        } else {
            output
        };
        let coalesce = !self.inner.config.check_update_interval.is_zero();

        let mut records = self.inner.records.write();
        let Some(c) = records.checks.get_mut(id) else {
            return;
        };
        let Some(check) = c.check.as_mut() else {
            return;
        };

        // not a catalog field, always kept current
        if status == HEALTH_CRITICAL {
            if c.critical_since.is_none() {
                c.critical_since = Some(Utc::now());
            }
        } else {
            c.critical_since = None;
        }

        if check.status == status && check.output == output {
            return;
        }

        if coalesce && check.status == status {
            check.output = output.to_string();
            self.defer_check_sync(&mut records, id);
            return;
        }

        check.status = status.to_string();
        check.output = output.to_string();
        c.in_sync = false;
        let service_id = check.service_id.clone();
        records.notify_if_aliased(&service_id);
        self.inner.change_made();
    }

    /// Arms the write-back timer for `id` unless one is already pending.
    fn defer_check_sync(&self, records: &mut Records, id: &str) {
        if records.deferred.contains_key(id) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime to defer check '{}', syncing now", id);
            if let Some(c) = records.checks.get_mut(id) {
                c.in_sync = false;
            }
            self.inner.change_made();
            return;
        };

        let window = self.inner.config.check_update_interval;
        let delay = (window / 2).saturating_add(random_stagger(window));
        let seq = records.next_timer_seq;
        records.next_timer_seq += 1;

        let inner = Arc::downgrade(&self.inner);
        let check_id = id.to_string();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire_deferred(&check_id, seq);
            }
        });

        records.deferred.insert(
            id.to_string(),
            DeferredCheck {
                seq,
                timer: task.abort_handle(),
            },
        );
    }

    /// Live check by id
    pub fn check(&self, id: &str) -> Option<CheckState> {
        let records = self.inner.records.read();
        records.checks.get(id).filter(|c| c.check.is_some()).cloned()
    }

    /// All live checks
    pub fn checks(&self) -> HashMap<String, CheckState> {
        let records = self.inner.records.read();
        records
            .checks
            .iter()
            .filter(|(_, c)| c.check.is_some())
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect()
    }

    /// Live checks attached to `service_id`
    pub fn checks_for_service(&self, service_id: &str) -> HashMap<String, CheckState> {
        self.checks()
            .into_iter()
            .filter(|(_, c)| c.check.as_ref().is_some_and(|check| check.service_id == service_id))
            .collect()
    }

    /// Live checks currently in critical state
    pub fn critical_checks(&self) -> HashMap<String, CheckState> {
        self.checks()
            .into_iter()
            .filter(|(_, c)| c.is_critical())
            .collect()
    }

    /// Number of check output write-backs currently waiting
    pub fn deferred_checks(&self) -> usize {
        self.inner.records.read().deferred.len()
    }

    /// Merges node metadata fields into the local set.
    pub fn load_metadata(&self, data: HashMap<String, String>) {
        let mut records = self.inner.records.write();
        records.metadata.extend(data);
        self.inner.change_made();
    }

    /// Clears the local node metadata
    pub fn unload_metadata(&self) {
        self.inner.records.write().metadata.clear();
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.inner.records.read().metadata.clone()
    }

    /// Debugging counters: live services and checks
    pub fn stats(&self) -> HashMap<String, String> {
        let records = self.inner.records.read();
        let services = records.services.values().filter(|s| s.service.is_some()).count();
        let checks = records.checks.values().filter(|c| c.check.is_some()).count();

        HashMap::from([
            ("services".to_string(), services.to_string()),
            ("checks".to_string(), checks.to_string()),
        ])
    }

    #[cfg(test)]
    pub(crate) fn set_service_in_sync(&self, id: &str, in_sync: bool) {
        if let Some(s) = self.inner.records.write().services.get_mut(id) {
            s.in_sync = in_sync;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_check_in_sync(&self, id: &str, in_sync: bool) {
        if let Some(c) = self.inner.records.write().checks.get_mut(id) {
            c.in_sync = in_sync;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use shared::protocol::{HEALTH_PASSING, HEALTH_WARNING};
    use crate::mock::MockCatalog;

    fn test_config() -> Config {
        Config {
            node_name: "node1".to_string(),
            node_id: "40e4a748-2192-161a-0510-9bf59fe950b5".to_string(),
            acl_token: "default-token".to_string(),
            check_update_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn test_state(config: Config) -> LocalState {
        LocalState::new(config, Arc::new(MockCatalog::default()))
    }

    fn service(name: &str) -> NodeService {
        NodeService {
            service: name.to_string(),
            port: 8080,
            ..Default::default()
        }
    }

    fn check(id: &str, status: &str) -> HealthCheck {
        HealthCheck {
            check_id: id.to_string(),
            name: id.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    async fn triggered(state: &LocalState) -> bool {
        tokio::time::timeout(Duration::from_millis(10), state.inner.trigger.notified())
            .await
            .is_ok()
    }

    #[test]
    fn test_add_service_assigns_id() {
        let state = test_state(test_config());
        state.add_service(service("web"), "");

        let s = state.service("web").unwrap();
        assert_eq!(s.service.unwrap().id, "web");
        assert!(!s.in_sync);
    }

    #[test]
    fn test_remove_service_tombstones() {
        let state = test_state(test_config());
        state.add_service(service("web"), "t1");
        state.add_service(service("db"), "");

        state.remove_service("web").unwrap();

        assert!(state.service("web").is_none());
        assert!(!state.services().contains_key("web"));
        assert_eq!(state.services().len(), 1);
        assert_eq!(state.stats()["services"], "1");

        // tombstone keeps its token for the pending deregistration
        let records = state.inner.records.read();
        let tombstone = &records.services["web"];
        assert!(tombstone.service.is_none());
        assert!(!tombstone.in_sync);
        assert_eq!(tombstone.token, "t1");
    }

    #[test]
    fn test_remove_service_unknown() {
        let state = test_state(test_config());
        assert!(matches!(
            state.remove_service("nope"),
            Err(StateError::ServiceNotFound(id)) if id == "nope"
        ));

        state.add_service(service("web"), "");
        state.remove_service("web").unwrap();
        assert!(state.remove_service("web").is_err(), "already tombstoned");
    }

    #[test]
    fn test_tokens_fall_back_to_default() {
        let state = test_state(test_config());
        state.add_service(service("web"), "");
        state.add_service(service("api"), "api-token");
        state.add_check(check("mem", HEALTH_PASSING), "check-token").unwrap();

        assert_eq!(state.service_token("web"), "default-token");
        assert_eq!(state.service_token("api"), "api-token");
        assert_eq!(state.service_token("missing"), "default-token");
        assert_eq!(state.check_token("mem"), "check-token");
        assert_eq!(state.check_token("missing"), "default-token");
    }

    #[test]
    fn test_add_check_stamps_node() {
        let state = test_state(test_config());
        let mut c = check("mem", HEALTH_PASSING);
        c.node = "someone-else".to_string();
        state.add_check(c, "").unwrap();

        assert_eq!(state.check("mem").unwrap().check.unwrap().node, "node1");
    }

    #[test]
    fn test_remove_check_tombstones() {
        let state = test_state(test_config());
        state.add_check(check("mem", HEALTH_CRITICAL), "").unwrap();
        assert!(state.check("mem").unwrap().is_critical());

        state.remove_check("mem");
        state.remove_check("mem");
        state.remove_check("never-added");

        assert!(state.check("mem").is_none());
        assert!(state.checks().is_empty());
        assert_eq!(state.stats()["checks"], "0");

        let records = state.inner.records.read();
        assert!(records.checks["mem"].critical_since.is_none());
    }

    #[test]
    fn test_update_check_critical_since() {
        let state = test_state(test_config());
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        assert!(state.check("mem").unwrap().critical_since.is_none());

        state.update_check("mem", HEALTH_CRITICAL, "down");
        let since = state.check("mem").unwrap().critical_since.unwrap();

        state.update_check("mem", HEALTH_CRITICAL, "still down");
        assert_eq!(state.check("mem").unwrap().critical_since, Some(since));
        assert_eq!(state.critical_checks().len(), 1);

        state.update_check("mem", HEALTH_WARNING, "recovering");
        assert!(state.check("mem").unwrap().critical_since.is_none());
        assert!(state.critical_checks().is_empty());
    }

    #[test]
    fn test_update_check_idempotent() {
        let state = test_state(test_config());
        state.add_check(check("mem", HEALTH_CRITICAL), "").unwrap();
        state.update_check("mem", HEALTH_CRITICAL, "oom");
        state.set_check_in_sync("mem", true);
        let before = state.check("mem").unwrap();

        state.update_check("mem", HEALTH_CRITICAL, "oom");
        state.update_check("mem", HEALTH_CRITICAL, "oom");

        let after = state.check("mem").unwrap();
        assert!(after.in_sync);
        assert_eq!(after.critical_since, before.critical_since);
    }

    #[test]
    fn test_update_check_marks_out_of_sync() {
        let state = test_state(test_config());
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        state.set_check_in_sync("mem", true);

        // no coalescing window: output alone is pushed immediately
        state.update_check("mem", HEALTH_PASSING, "new output");
        let c = state.check("mem").unwrap();
        assert!(!c.in_sync);
        assert_eq!(c.check.unwrap().output, "new output");
        assert_eq!(state.deferred_checks(), 0);
    }

    #[test]
    fn test_update_unknown_check_is_noop() {
        let state = test_state(test_config());
        state.update_check("ghost", HEALTH_CRITICAL, "");
        assert!(state.check("ghost").is_none());
    }

    #[test]
    fn test_discard_check_output() {
        let state = test_state(test_config());
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        state.set_discard_check_output(true);

        state.update_check("mem", HEALTH_WARNING, "verbose output");
        assert_eq!(state.check("mem").unwrap().check.unwrap().output, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_output_coalesced() {
        let mut config = test_config();
        config.check_update_interval = Duration::from_secs(10);
        let state = test_state(config);
        state.add_check(check("web:http", HEALTH_PASSING), "").unwrap();
        state.set_check_in_sync("web:http", true);

        for i in 0..3 {
            state.update_check("web:http", HEALTH_PASSING, &format!("output {}", i));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        assert_eq!(state.deferred_checks(), 1);
        let c = state.check("web:http").unwrap();
        assert!(c.in_sync, "output-only change must not flip the flag yet");
        assert_eq!(c.check.unwrap().output, "output 2");

        // window / 2 + jitter(window) is at most 15s
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(!state.check("web:http").unwrap().in_sync);
        assert_eq!(state.deferred_checks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_not_fired_early() {
        let mut config = test_config();
        config.check_update_interval = Duration::from_secs(10);
        let state = test_state(config);
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        state.set_check_in_sync("mem", true);

        state.update_check("mem", HEALTH_PASSING, "changed");
        tokio::time::sleep(Duration::from_millis(4900)).await;

        assert!(state.check("mem").unwrap().in_sync);
        assert_eq!(state.deferred_checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_change_bypasses_deferral() {
        let mut config = test_config();
        config.check_update_interval = Duration::from_secs(10);
        let state = test_state(config);
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        state.set_check_in_sync("mem", true);

        state.update_check("mem", HEALTH_CRITICAL, "oom");

        assert!(!state.check("mem").unwrap().in_sync);
        assert_eq!(state.deferred_checks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_timer_ignores_removed_check() {
        let mut config = test_config();
        config.check_update_interval = Duration::from_secs(10);
        let state = test_state(config);
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        state.update_check("mem", HEALTH_PASSING, "changed");
        assert_eq!(state.deferred_checks(), 1);

        state.remove_check("mem");
        assert_eq!(state.deferred_checks(), 0);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(state.check("mem").is_none());
    }

    #[tokio::test]
    async fn test_change_signal_coalesced() {
        let state = test_state(test_config());
        state.add_service(service("web"), "");
        state.add_service(service("db"), "");
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();

        assert!(triggered(&state).await);
        assert!(!triggered(&state).await, "excess signals are dropped");
    }

    #[tokio::test]
    async fn test_remove_service_signals() {
        let state = test_state(test_config());
        state.add_service(service("web"), "");
        assert!(triggered(&state).await);

        state.remove_service("web").unwrap();
        assert!(triggered(&state).await);
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let state = test_state(test_config());
        state.pause();
        state.pause();
        assert!(state.is_paused());

        state.resume();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());
        assert!(triggered(&state).await, "resume forces a sync");
    }

    #[test]
    #[should_panic(expected = "unbalanced")]
    fn test_unbalanced_resume_panics() {
        let state = test_state(test_config());
        state.pause();
        state.resume();
        state.resume();
    }

    #[tokio::test]
    async fn test_watchers_notified() {
        let state = test_state(test_config());
        let (tx, mut rx) = mpsc::channel(1);
        state.notify(tx.clone());

        state.add_service(service("web"), "");
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "full channel already carries a notice");

        state.stop_notify(&tx);
        state.remove_check("mem");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_service_with_checks() {
        let state = test_state(test_config());
        let mut http = check("web:http", HEALTH_PASSING);
        http.service_id = "web".to_string();
        state.add_service_with_checks(service("web"), vec![http, check("mem", HEALTH_PASSING)], "t1").unwrap();

        assert_eq!(state.checks_for_service("web").len(), 1);
        assert_eq!(state.check_token("mem"), "t1");

        state
            .remove_service_with_checks("web", &["web:http".to_string()])
            .unwrap();
        assert!(state.service("web").is_none());
        assert!(state.checks_for_service("web").is_empty());
        assert!(state.check("mem").is_some());
    }

    #[test]
    fn test_metadata() {
        let state = test_state(test_config());
        state.load_metadata(HashMap::from([("rack".to_string(), "r1".to_string())]));
        state.load_metadata(HashMap::from([("zone".to_string(), "z1".to_string())]));

        let meta = state.metadata();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta["rack"], "r1");

        state.unload_metadata();
        assert!(state.metadata().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_since_independent_of_deferral() {
        let mut config = test_config();
        config.check_update_interval = Duration::from_secs(10);
        let state = test_state(config);
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        state.set_check_in_sync("mem", true);

        state.update_check("mem", HEALTH_CRITICAL, "oom");
        let since = state.check("mem").unwrap().critical_since;
        assert!(since.is_some());
        state.set_check_in_sync("mem", true);

        // output-only churn is deferred but leaves the timestamp alone
        state.update_check("mem", HEALTH_CRITICAL, "oom 2");
        state.update_check("mem", HEALTH_CRITICAL, "oom 3");
        assert_eq!(state.deferred_checks(), 1);
        assert_eq!(state.check("mem").unwrap().critical_since, since);

        // recovery clears it at once, timer still pending
        state.update_check("mem", HEALTH_PASSING, "ok");
        assert!(state.check("mem").unwrap().critical_since.is_none());
        assert_eq!(state.deferred_checks(), 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(state.deferred_checks(), 0);
        assert!(state.check("mem").unwrap().critical_since.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_timer_keeps_critical_since() {
        let mut config = test_config();
        config.check_update_interval = Duration::from_secs(10);
        let state = test_state(config);
        state.add_check(check("mem", HEALTH_CRITICAL), "").unwrap();
        let since = state.check("mem").unwrap().critical_since;
        assert!(since.is_some());

        state.update_check("mem", HEALTH_CRITICAL, "still down");
        assert_eq!(state.deferred_checks(), 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        let c = state.check("mem").unwrap();
        assert!(!c.in_sync);
        assert_eq!(c.critical_since, since);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferral_with_huge_window() {
        let mut config = test_config();
        config.check_update_interval = Duration::MAX;
        let state = test_state(config);
        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();

        state.update_check("mem", HEALTH_PASSING, "changed");
        assert_eq!(state.deferred_checks(), 1);
    }

    #[test]
    fn test_check_requires_live_service() {
        let state = test_state(test_config());
        let mut http = check("web:http", HEALTH_PASSING);
        http.service_id = "web".to_string();

        assert!(matches!(
            state.add_check(http.clone(), ""),
            Err(StateError::CheckServiceNotFound { check_id, service_id })
                if check_id == "web:http" && service_id == "web"
        ));
        assert!(state.check("web:http").is_none());

        state.add_service(service("web"), "");
        state.add_check(http.clone(), "").unwrap();

        state.remove_service("web").unwrap();
        state.remove_check("web:http");
        assert!(state.add_check(http, "").is_err(), "tombstoned service");
    }

    #[test]
    fn test_service_with_checks_is_atomic() {
        let state = test_state(test_config());
        let mut orphan = check("db:tcp", HEALTH_PASSING);
        orphan.service_id = "db".to_string();

        assert!(state
            .add_service_with_checks(service("web"), vec![check("mem", HEALTH_PASSING), orphan], "")
            .is_err());
        assert!(state.service("web").is_none());
        assert!(state.check("mem").is_none());
    }

    #[test]
    fn test_service_exists() {
        let state = test_state(test_config());
        assert!(!state.service_exists("web"));

        state.add_service(service("web"), "");
        assert!(state.service_exists("web"));

        state.remove_service("web").unwrap();
        assert!(!state.service_exists("web"));
    }

    #[test]
    fn test_services_by_name() {
        let state = test_state(test_config());
        for id in ["web-1", "web-2"] {
            state.add_service(
                NodeService {
                    id: id.to_string(),
                    ..service("web")
                },
                "",
            );
        }
        state.add_service(service("db"), "");
        state.remove_service("web-2").unwrap();

        let found = state.services_by_name("web");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "web-1");
        assert!(state.services_by_name("cache").is_empty());
    }

    #[test]
    fn test_alias_notified_on_service_changes() {
        let state = test_state(test_config());
        let (tx, mut rx) = mpsc::channel(1);
        state.add_alias_check("web-alias", "web", tx);

        state.add_service(service("web"), "");
        assert!(rx.try_recv().is_ok());

        // replacing an existing service is not an appearance
        state.add_service(service("web"), "");
        assert!(rx.try_recv().is_err());

        state.add_service(service("db"), "");
        assert!(rx.try_recv().is_err(), "other services do not wake the alias");

        state.remove_service("web").unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_alias_notified_on_check_changes() {
        let state = test_state(test_config());
        state.add_service(service("web"), "");
        let (tx, mut rx) = mpsc::channel(1);
        state.add_alias_check("web-alias", "web", tx);

        let mut http = check("web:http", HEALTH_PASSING);
        http.service_id = "web".to_string();
        state.add_check(http, "").unwrap();
        assert!(rx.try_recv().is_ok());

        state.update_check("web:http", HEALTH_CRITICAL, "down");
        assert!(rx.try_recv().is_ok());

        // unchanged result
        state.update_check("web:http", HEALTH_CRITICAL, "down");
        assert!(rx.try_recv().is_err());

        state.add_check(check("mem", HEALTH_PASSING), "").unwrap();
        state.update_check("mem", HEALTH_CRITICAL, "oom");
        assert!(rx.try_recv().is_err(), "checks of other services do not wake the alias");

        state.remove_check("web:http");
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_alias_notices_coalesce() {
        let state = test_state(test_config());
        let (tx, mut rx) = mpsc::channel(1);
        state.add_alias_check("web-alias", "web", tx);

        state.add_service(service("web"), "");
        state.remove_service("web").unwrap();
        state.add_service(service("web"), "");

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "a full channel already carries a notice");
    }

    #[test]
    fn test_remove_alias_check() {
        let state = test_state(test_config());
        let (tx, mut rx) = mpsc::channel(1);
        state.add_alias_check("web-alias", "web", tx);
        state.remove_alias_check("web-alias", "web");
        state.remove_alias_check("web-alias", "web");

        state.add_service(service("web"), "");
        assert!(rx.try_recv().is_err());
        assert!(state.inner.records.read().check_aliases.is_empty());
    }
}
