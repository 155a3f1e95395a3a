//! Envelope (JSON), the unit exchanged over the socket and on broker topics.
//!
//! Decoding rules:
//! - `kind` and `conversation_id` are required; anything else has a default.
//! - Unknown fields are ignored so older gateways tolerate newer producers.
//! - `sender_id` is parsed leniently: an unusable value becomes `None`
//!   because the gateway overwrites it from the session anyway.
//! - `timestamp` is parsed leniently too: anything that is not an RFC 3339
//!   string falls back to the receive time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, RoomcastError};

use super::ids::{ConversationId, UserId};

/// Passthrough metadata (string -> scalar).
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key carrying the subject of a presence envelope.
pub const PRESENCE_USER_KEY: &str = "user_id";

/// Closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Chat,
    Typing,
    Read,
    MemberJoined,
    MemberLeft,
}

impl Kind {
    /// Presence kinds are synthesized by the hub and never accepted from a socket.
    pub fn is_client_originated(self) -> bool {
        !matches!(self, Kind::MemberJoined | Kind::MemberLeft)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Chat => "chat",
            Kind::Typing => "typing",
            Kind::Read => "read",
            Kind::MemberJoined => "member_joined",
            Kind::MemberLeft => "member_left",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: Kind,

    pub conversation_id: ConversationId,

    #[serde(
        default,
        deserialize_with = "lenient_user_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<UserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Opaque payload; ciphertext when `is_encrypted` is set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    #[serde(default)]
    pub is_encrypted: bool,

    /// `text`, `image`, `video`, `file`, ... (free-form).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,

    /// Publishing gateway instance. Only meaningful on broker topics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

fn lenient_user_id<'de, D>(de: D) -> std::result::Result<Option<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.and_then(|s| UserId::parse(s).ok()))
}

fn lenient_timestamp<'de, D>(de: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(de)?;
    let parsed = match raw {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s).ok(),
        _ => None,
    };
    Ok(parsed.map_or_else(Utc::now, |t| t.with_timezone(&Utc)))
}

impl Envelope {
    fn bare(kind: Kind, conversation_id: ConversationId) -> Self {
        Self {
            kind,
            conversation_id,
            sender_id: None,
            message_id: None,
            content: String::new(),
            is_encrypted: false,
            content_type: None,
            metadata: None,
            timestamp: Utc::now(),
            origin: None,
        }
    }

    /// Build a chat envelope (used by producers that publish without a socket).
    pub fn chat(conversation_id: ConversationId, sender: UserId, content: impl Into<String>) -> Self {
        let mut env = Self::bare(Kind::Chat, conversation_id);
        env.sender_id = Some(sender);
        env.content = content.into();
        env.content_type = Some("text".to_string());
        env.message_id = Some(Uuid::new_v4().to_string());
        env
    }

    /// Synthesize `member_joined` / `member_left`. No content, no sender;
    /// the subject is carried in `metadata.user_id`.
    pub fn presence(kind: Kind, conversation_id: ConversationId, user: &UserId) -> Self {
        let mut env = Self::bare(kind, conversation_id);
        let mut meta = Metadata::new();
        meta.insert(PRESENCE_USER_KEY.to_string(), Value::String(user.to_string()));
        env.metadata = Some(meta);
        env
    }

    /// Subject of a presence envelope, if any.
    pub fn presence_user(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(PRESENCE_USER_KEY))
            .and_then(Value::as_str)
    }

    /// Decode and validate one JSON frame or broker payload.
    pub fn decode(raw: &str) -> Result<Self> {
        let env: Envelope = serde_json::from_str(raw)?;
        env.validate()?;
        Ok(env)
    }

    pub fn decode_bytes(raw: &[u8]) -> Result<Self> {
        let env: Envelope = serde_json::from_slice(raw)?;
        env.validate()?;
        Ok(env)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| RoomcastError::Internal(format!("envelope encode failed: {e}")))
    }

    /// Metadata must be a flat map of scalars.
    pub fn validate(&self) -> Result<()> {
        if let Some(meta) = &self.metadata {
            if let Some((key, _)) = meta
                .iter()
                .find(|(_, v)| matches!(v, Value::Array(_) | Value::Object(_)))
            {
                return Err(RoomcastError::BadRequest(format!(
                    "metadata.{key} must be a scalar"
                )));
            }
        }
        Ok(())
    }

    /// Overwrite identity fields from the authenticated session. Wire values
    /// for sender, conversation, timestamp and origin are never trusted.
    pub fn stamp(&mut self, sender: &UserId, conversation: &ConversationId) {
        self.sender_id = Some(sender.clone());
        self.conversation_id = conversation.clone();
        self.timestamp = Utc::now();
        self.origin = None;
    }

    /// Enforce per-kind field shape: only chat carries a message id and content.
    pub fn normalize(&mut self) {
        if self.kind == Kind::Chat {
            if self.message_id.as_deref().map_or(true, str::is_empty) {
                self.message_id = Some(Uuid::new_v4().to_string());
            }
        } else {
            self.message_id = None;
            self.content.clear();
            self.content_type = None;
        }
    }
}
