//! Request admission policy.
//!
//! Compiled from config once at startup and consulted by the upgrade handler.

pub mod origin;

pub use origin::OriginAllowlist;
