use serde::Deserialize;
use roomcast_core::error::{Result, RoomcastError};
use roomcast_core::protocol::topic::DEFAULT_TOPIC_PREFIX;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub version: u32,

    pub gateway: GatewaySection,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub broker: BrokerSection,

    #[serde(default)]
    pub auth: AuthSection,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RoomcastError::UnsupportedVersion);
        }

        self.gateway.validate()?;
        self.hub.validate()?;
        self.broker.validate()?;
        self.auth.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Keep-alive ping interval.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Read deadline; refreshed by every inbound frame including pongs.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Exact origins (`https://app.example.com`) or `https://*.example.com`.
    pub allowed_origins: Vec<String>,
}

impl GatewaySection {
    pub fn validate(&self) -> Result<()> {
        if !(5000..=120000).contains(&self.ping_interval_ms) {
            return Err(RoomcastError::BadRequest(
                "gateway.ping_interval_ms must be between 5000 and 120000".into(),
            ));
        }
        if !(10000..=600000).contains(&self.idle_timeout_ms) {
            return Err(RoomcastError::BadRequest(
                "gateway.idle_timeout_ms must be between 10000 and 600000".into(),
            ));
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(RoomcastError::BadRequest(
                "gateway.idle_timeout_ms must be greater than ping_interval_ms".into(),
            ));
        }
        if !(1000..=60000).contains(&self.write_timeout_ms) {
            return Err(RoomcastError::BadRequest(
                "gateway.write_timeout_ms must be between 1000 and 60000".into(),
            ));
        }
        if self.max_frame_bytes < 256 {
            return Err(RoomcastError::BadRequest(
                "gateway.max_frame_bytes must be at least 256".into(),
            ));
        }
        if self.allowed_origins.is_empty() {
            return Err(RoomcastError::BadRequest(
                "gateway.allowed_origins must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_ping_interval_ms() -> u64 {
    54000
}
fn default_idle_timeout_ms() -> u64 {
    60000
}
fn default_write_timeout_ms() -> u64 {
    10000
}
fn default_max_frame_bytes() -> usize {
    65536
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubSection {
    /// Per-connection outbox; a full outbox evicts the connection.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Depth of the registry's inbound command channel.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            outbox_capacity: default_outbox_capacity(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl HubSection {
    pub fn validate(&self) -> Result<()> {
        if self.outbox_capacity == 0 {
            return Err(RoomcastError::BadRequest("hub.outbox_capacity must be > 0".into()));
        }
        if self.command_buffer == 0 {
            return Err(RoomcastError::BadRequest("hub.command_buffer must be > 0".into()));
        }
        Ok(())
    }
}

fn default_outbox_capacity() -> usize {
    256
}
fn default_command_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// In-process broadcast; single instance only.
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    #[serde(default = "default_backend")]
    pub backend: BrokerBackend,

    /// Required for `redis`. Never logged (may carry credentials).
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Also publish socket-originated envelopes so other instances see them.
    #[serde(default = "default_republish")]
    pub republish_client_events: bool,

    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            topic_prefix: default_topic_prefix(),
            republish_client_events: default_republish(),
            resubscribe_backoff_ms: default_resubscribe_backoff_ms(),
        }
    }
}

impl BrokerSection {
    pub fn validate(&self) -> Result<()> {
        if self.backend == BrokerBackend::Redis && self.url.as_deref().map_or(true, str::is_empty) {
            return Err(RoomcastError::BadRequest(
                "broker.url is required for the redis backend".into(),
            ));
        }
        if self.topic_prefix.is_empty() {
            return Err(RoomcastError::BadRequest("broker.topic_prefix must not be empty".into()));
        }
        if !(100..=60000).contains(&self.resubscribe_backoff_ms) {
            return Err(RoomcastError::BadRequest(
                "broker.resubscribe_backoff_ms must be between 100 and 60000".into(),
            ));
        }
        Ok(())
    }
}

fn default_backend() -> BrokerBackend {
    BrokerBackend::Memory
}
fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.into()
}
fn default_republish() -> bool {
    true
}
fn default_resubscribe_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    /// Header the upstream auth layer sets to the verified user id.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
        }
    }
}

impl AuthSection {
    pub fn validate(&self) -> Result<()> {
        axum::http::HeaderName::from_bytes(self.user_header.as_bytes()).map_err(|_| {
            RoomcastError::BadRequest(format!("auth.user_header is not a valid header name: {}", self.user_header))
        })?;
        Ok(())
    }
}

fn default_user_header() -> String {
    "x-user-id".into()
}
