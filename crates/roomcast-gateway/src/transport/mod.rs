//! Transport layer (WebSocket).
//!
//! Exposes the upgrade handler, the per-connection pumps, and the codec that
//! decodes each text frame once before it reaches the hub.

pub mod codec;
pub mod session;
pub mod ws;
