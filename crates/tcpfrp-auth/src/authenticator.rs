//! Authenticator trait for pluggable login validation
//!
//! A control session hands the credentials from its `Login` frame to an
//! [`Authenticator`] and only proceeds when it answers `true`. Implement the
//! trait to plug in any strategy (JWT, API keys, database lookup, ...).

use async_trait::async_trait;
use std::collections::HashSet;

/// Login credential validator
///
/// # Example: API Key Authenticator
///
/// ```ignore
/// use tcpfrp_auth::{async_trait, Authenticator};
///
/// struct ApiKeyAuthenticator {
///     keys: HashSet<String>,
/// }
///
/// #[async_trait]
/// impl Authenticator for ApiKeyAuthenticator {
///     async fn validate(&self, credentials: &str) -> bool {
///         self.keys.contains(credentials)
///     }
/// }
/// ```
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns true when the credentials grant a control session
    async fn validate(&self, credentials: &str) -> bool;
}

/// Accepts every login. Only meant for local development.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn validate(&self, _credentials: &str) -> bool {
        true
    }
}

/// Accepts a fixed set of shared tokens
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashSet<String>,
}

impl StaticTokenAuthenticator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn validate(&self, credentials: &str) -> bool {
        !credentials.is_empty() && self.tokens.contains(credentials)
    }
}
