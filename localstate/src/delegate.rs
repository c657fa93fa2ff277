use shared::protocol::{DeregisterRequest, NodeServices, NodeSpecificRequest, RegisterRequest};
use shared::types::HealthCheck;
use crate::error::RpcError;

/// Connection to the catalog that holds the authoritative record.
///
/// Calls block until the catalog answers; timeouts belong to the
/// implementation. Errors must be classified into `RpcError` variants,
/// the sync engine branches on them.
pub trait Delegate: Send + Sync + 'static {
    /// Number of known cluster members, used to scale sync intervals
    fn lan_members(&self) -> usize;

    /// Catalog.NodeServices
    fn node_services(&self, req: &NodeSpecificRequest) -> Result<Option<NodeServices>, RpcError>;

    /// Health.NodeChecks
    fn node_checks(&self, req: &NodeSpecificRequest) -> Result<Vec<HealthCheck>, RpcError>;

    /// Catalog.Register
    fn register(&self, req: &RegisterRequest) -> Result<(), RpcError>;

    /// Catalog.Deregister
    fn deregister(&self, req: &DeregisterRequest) -> Result<(), RpcError>;
}
