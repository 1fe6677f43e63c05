//! Credentials and the contract for connecting with them.

use crate::errors::Result;
use crate::utils::{now_utc, Timestamp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// An access token and the moment it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Opaque token.
    pub token: String,
    /// Expiry instant.
    pub expires_at: Timestamp,
}

impl Credential {
    /// Creates a credential.
    #[must_use]
    pub fn new(token: impl Into<String>, expires_at: Timestamp) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Returns true if the credential expires within `buffer` from now.
    #[must_use]
    pub fn expires_within(&self, buffer: Duration) -> bool {
        let Ok(buffer) = chrono::Duration::from_std(buffer) else {
            return true;
        };
        now_utc()
            .checked_add_signed(buffer)
            .map_or(true, |horizon| self.expires_at <= horizon)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies tokens and connection parameters for a backend.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A currently valid token.
    async fn get_token(&self) -> Result<Credential>;

    /// Host, database and similar parameters.
    async fn get_connection_params(&self) -> Result<HashMap<String, String>>;
}

/// Opens, refreshes and closes physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The physical connection handle.
    type Connection: Send + 'static;

    /// Opens a connection.
    async fn connect(
        &self,
        params: &HashMap<String, String>,
        credential: &Credential,
    ) -> Result<Self::Connection>;

    /// Applies a new credential to an open connection.
    async fn refresh(&self, connection: &mut Self::Connection, credential: &Credential)
        -> Result<()>;

    /// Closes a connection.
    async fn close(&self, connection: Self::Connection) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_within() {
        let soon = Credential::new("t", now_utc() + chrono::Duration::seconds(30));
        assert!(soon.expires_within(Duration::from_secs(60)));
        assert!(!soon.expires_within(Duration::from_secs(5)));

        let expired = Credential::new("t", now_utc() - chrono::Duration::seconds(1));
        assert!(expired.expires_within(Duration::ZERO));
    }

    #[test]
    fn test_debug_redacts_token() {
        let cred = Credential::new("secret-token", now_utc());
        assert!(!format!("{cred:?}").contains("secret-token"));
    }
}
