//! Conversation-scoped connection registry ("hub").
//!
//! - `registry`: the single-owner actor and its `Hub` / `HubLink` handles.
//! - `room`: per-conversation membership and subscription state.
//! - `connection`: the outbox shared by the registry and a socket's pumps.

pub mod connection;
mod registry;
mod room;

pub use connection::{open as open_connection, ConnState, ConnectionHandle, Frame, Outbox, Refused};
pub use registry::{Hub, HubLink, HubSettings, HubSnapshot, RoomSnapshot, Source};
