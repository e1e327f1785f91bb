//! Authentication for tunnel control sessions
//!
//! The control plane only depends on the [`Authenticator`] capability; this crate
//! ships a few ready-made implementations.

pub mod authenticator;
pub mod jwt;

pub use authenticator::{AllowAll, Authenticator, StaticTokenAuthenticator};
pub use jwt::{JwtClaims, JwtError, JwtValidator};

// Re-export useful types
pub use async_trait::async_trait;
