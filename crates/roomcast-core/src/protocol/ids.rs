//! Identifiers.
//!
//! Conversation and user ids are opaque to this layer but still validated at
//! the edge: they end up in broker topic names and log fields, so only a
//! conservative character set is accepted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RoomcastError};

/// Longest accepted identifier, in bytes.
pub const MAX_ID_LEN: usize = 128;

fn validate_id(kind: &str, raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(RoomcastError::BadRequest(format!("{kind} must not be empty")));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(RoomcastError::BadRequest(format!(
            "{kind} longer than {MAX_ID_LEN} bytes"
        )));
    }
    let ok = raw
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b':' | b'.'));
    if !ok {
        return Err(RoomcastError::BadRequest(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(())
}

macro_rules! validated_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: impl Into<String>) -> Result<Self> {
                let raw = raw.into();
                validate_id($label, &raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = RoomcastError;

            fn try_from(raw: String) -> Result<Self> {
                Self::parse(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = RoomcastError;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

validated_id!(
    /// Stable conversation identifier; keys a room and its broker topic.
    ConversationId,
    "conversation_id"
);

validated_id!(
    /// Authenticated user identifier, as supplied by the auth layer.
    UserId,
    "user_id"
);

/// Process-local connection identity. Never persisted, never sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn accepts_uuid_and_slug_ids() {
        assert!(ConversationId::parse("conv-1").is_ok());
        assert!(ConversationId::parse("4f7c2a1e-9b1d-4c1b-8f7e-2d7c9a1b3e55").is_ok());
        assert!(UserId::parse("user:42").is_ok());
    }

    #[test]
    fn rejects_empty_and_hostile_ids() {
        assert!(ConversationId::parse("").is_err());
        assert!(ConversationId::parse("a b").is_err());
        assert!(ConversationId::parse("room*").is_err());
        assert!(ConversationId::parse("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn serde_goes_through_validation() {
        let id: ConversationId = serde_json::from_str("\"conv-9\"").unwrap();
        assert_eq!(id.as_str(), "conv-9");
        assert!(serde_json::from_str::<ConversationId>("\"\"").is_err());
    }
}
