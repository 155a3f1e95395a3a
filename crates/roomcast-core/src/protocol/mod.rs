//! Protocol modules.
//!
//! - `envelope`: the JSON unit exchanged with clients and on broker topics.
//! - `ids`: validated identifiers for conversations, users and connections.
//! - `topic`: deterministic broker topic naming.
//!
//! The transport and the broker bridge share one decoder: a frame from a
//! socket and a payload from a topic are both an `Envelope`.

pub mod envelope;
pub mod ids;
pub mod topic;

pub use envelope::{Envelope, Kind, Metadata};
pub use ids::{ConnectionId, ConversationId, UserId};
