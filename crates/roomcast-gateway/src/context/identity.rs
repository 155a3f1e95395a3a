//! Request identity supplied by the authentication layer in front of us.
//!
//! Token issuance and verification live outside this service. The gateway
//! only needs a trusted `UserId` on each upgrade request.

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{request::Parts, HeaderName},
    middleware::Next,
    response::Response,
};

use roomcast_core::error::{Result, RoomcastError};
use roomcast_core::UserId;

use crate::app_state::AppState;

/// Identity attached to a request by `require_identity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, parts: &Parts) -> Result<UserId>;
}

/// Trusts a header set by an upstream proxy that already verified the caller.
#[derive(Debug, Clone)]
pub struct TrustedHeaderAuthenticator {
    header: HeaderName,
}

impl TrustedHeaderAuthenticator {
    pub fn new(header: &str) -> Result<Self> {
        let header = HeaderName::try_from(header)
            .map_err(|e| RoomcastError::BadRequest(format!("invalid auth.user_header: {e}")))?;
        Ok(Self { header })
    }
}

#[async_trait]
impl Authenticator for TrustedHeaderAuthenticator {
    async fn authenticate(&self, parts: &Parts) -> Result<UserId> {
        let raw = parts
            .headers
            .get(&self.header)
            .ok_or(RoomcastError::Unauthorized)?
            .to_str()
            .map_err(|_| RoomcastError::Unauthorized)?;
        UserId::parse(raw.trim()).map_err(|_| RoomcastError::Unauthorized)
    }
}

/// Middleware: resolve the caller and insert `AuthenticatedUser`.
///
/// A request that fails authentication passes through without the extension;
/// handlers that need an identity reject it themselves.
pub async fn require_identity(State(app): State<AppState>, req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    match app.authenticator().authenticate(&parts).await {
        Ok(user) => {
            parts.extensions.insert(AuthenticatedUser(user));
        }
        Err(e) => tracing::debug!(error = %e, path = %parts.uri.path(), "request carries no identity"),
    }
    next.run(Request::from_parts(parts, body)).await
}
