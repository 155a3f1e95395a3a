//! Broker topic naming.
//!
//! A room's topic is `prefix + conversation_id`. Any producer that knows the
//! prefix can fan an envelope into a conversation without holding a socket.

use super::ids::ConversationId;

/// Prefix used when the deployment does not configure one.
pub const DEFAULT_TOPIC_PREFIX: &str = "chat:";

pub fn room_topic(prefix: &str, conversation: &ConversationId) -> String {
    let mut topic = String::with_capacity(prefix.len() + conversation.as_str().len());
    topic.push_str(prefix);
    topic.push_str(conversation.as_str());
    topic
}
