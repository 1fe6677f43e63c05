//! Credentialed connection pooling.

mod credential;
#[allow(clippy::module_inception)]
mod pool;

pub use credential::{Connector, Credential, CredentialProvider};
pub use pool::{ConnectionPool, PoolConfig, PoolGuard, PoolStats};
