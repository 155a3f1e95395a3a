//! roomcast gateway library entry.
//!
//! Wires the WebSocket transport, the per-conversation hub, and the pub/sub
//! broker bridge into one axum application. Consumed by the binary
//! (`main.rs`) and by integration tests.

pub mod app_state;
pub mod broker;
pub mod config;
pub mod context;
pub mod hub;
pub mod obs;
pub mod ops;
pub mod policy;
pub mod router;
pub mod transport;
