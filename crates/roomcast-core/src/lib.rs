//! roomcast core: transport-agnostic wire contracts and the shared error type.
//!
//! This crate defines the envelope schema exchanged over the WebSocket
//! transport and over the pub/sub broker, the identifiers that key rooms and
//! connections, and the error surface shared by the gateway. It carries no
//! transport or runtime dependencies so producers that only publish to the
//! broker can depend on it alone.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths must surface as `RoomcastError`/`Result` so a hostile
//! frame can never take the process down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod protocol;

/// Shared result type.
pub use error::{Result, RoomcastError};
pub use protocol::{ConnectionId, ConversationId, Envelope, Kind, UserId};
