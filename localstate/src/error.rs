use thiserror::Error;

/// Failure reported by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The token may not perform this write. Treated as final.
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Unknown check '{0}'")]
    UnknownCheck(String),

    /// Anything else; retried on a later pass.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("service '{0}' does not exist")]
    ServiceNotFound(String),

    #[error("check '{check_id}' refers to non-existent service '{service_id}'")]
    CheckServiceNotFound { check_id: String, service_id: String },

    #[error("ServiceID missing")]
    MissingServiceId,

    #[error("CheckID missing")]
    MissingCheckId,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("sync task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}
