//! Per-request context shared between middleware and handlers.

pub mod identity;

pub use identity::{require_identity, AuthenticatedUser, Authenticator, TrustedHeaderAuthenticator};
