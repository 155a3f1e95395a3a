//! Shared error type across roomcast crates.

use thiserror::Error;

/// Client-facing error codes (stable API).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCode {
    /// Invalid input / malformed message.
    BadRequest,
    /// No authenticated identity on the request.
    Unauthorized,
    /// Request origin is not on the allow-list.
    OriginRejected,
    /// Pub/sub broker failed (subscribe or publish).
    Broker,
    /// Hub is gone or the process is draining.
    Unavailable,
    /// Unsupported config/protocol version.
    UnsupportedVersion,
    /// Internal server error.
    Internal,
}

impl ClientCode {
    /// String representation used in logs and JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            ClientCode::BadRequest => "BAD_REQUEST",
            ClientCode::Unauthorized => "UNAUTHORIZED",
            ClientCode::OriginRejected => "ORIGIN_REJECTED",
            ClientCode::Broker => "BROKER",
            ClientCode::Unavailable => "UNAVAILABLE",
            ClientCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ClientCode::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RoomcastError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum RoomcastError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("origin rejected")]
    OriginRejected,
    #[error("broker: {0}")]
    Broker(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported version")]
    UnsupportedVersion,
    #[error("internal: {0}")]
    Internal(String),
}

impl RoomcastError {
    /// Map internal error to a stable client-facing code.
    pub fn client_code(&self) -> ClientCode {
        match self {
            RoomcastError::BadRequest(_) => ClientCode::BadRequest,
            RoomcastError::Unauthorized => ClientCode::Unauthorized,
            RoomcastError::OriginRejected => ClientCode::OriginRejected,
            RoomcastError::Broker(_) => ClientCode::Broker,
            RoomcastError::Unavailable(_) => ClientCode::Unavailable,
            RoomcastError::UnsupportedVersion => ClientCode::UnsupportedVersion,
            RoomcastError::Internal(_) => ClientCode::Internal,
        }
    }
}

impl From<serde_json::Error> for RoomcastError {
    fn from(e: serde_json::Error) -> Self {
        RoomcastError::BadRequest(format!("invalid envelope json: {e}"))
    }
}
