//! Local services, checks, and node metadata for a single agent, kept in
//! sync with the cluster catalog by an anti-entropy loop.

pub mod anti_entropy;
pub mod config;
pub mod delegate;
pub mod error;
pub mod scale;
pub mod state;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use config::Config;
pub use delegate::Delegate;
pub use error::{RpcError, StateError};
pub use state::{CheckState, LocalState, ServiceState};
