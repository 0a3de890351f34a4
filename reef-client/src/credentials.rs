//! Credentials used to authenticate against the cluster.

use std::fmt;
use std::sync::Arc;

use reef_core::service::ServiceType;

/// A username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Creates new credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the password through Debug output.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Pluggable source of credentials, resolved per service.
///
/// The static implementation returns the same pair everywhere; dynamic
/// providers can rotate passwords or hand out per-service identities.
pub trait CredentialsProvider: Send + Sync + fmt::Debug {
    /// Returns the credentials for the given service.
    fn credentials_for(&self, service: ServiceType) -> Credentials;
}

/// Provider returning one fixed username/password pair for every service.
#[derive(Debug, Clone)]
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    /// Creates a provider from a fixed pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(username, password),
        }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn credentials_for(&self, _service: ServiceType) -> Credentials {
        self.credentials.clone()
    }
}

/// Shared handle to a credentials provider.
pub type SharedCredentials = Arc<dyn CredentialsProvider>;
