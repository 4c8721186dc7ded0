/// Shared types for the chat layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay-issued conversation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    const PLACEHOLDER_PREFIX: &'static str = "pending:";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Display-only id shown while the relay resolves the conversation.
    /// Canonical over the unordered pair: "pending:{min_id}:{max_id}"
    pub fn placeholder(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}{}:{}", Self::PLACEHOLDER_PREFIX, lo, hi))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(Self::PLACEHOLDER_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative message id, assigned by the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local id of an optimistic entry. Lives in its own namespace and is never
/// compared against a `MessageId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProvisionalId(u64);

impl ProvisionalId {
    pub(crate) fn new(seq: u64) -> Self {
        Self(seq)
    }
}

impl fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// A direct conversation between exactly two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Sorted pair of participant user ids
    pub participants: [String; 2],
}

impl Conversation {
    pub fn new(id: ConversationId, a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        let participants = if a <= b { [a, b] } else { [b, a] };
        Self { id, participants }
    }

    pub fn includes(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The participant that is not `user_id`
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        match &self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

/// A relay-confirmed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

/// Delivery state of a visible entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Shown optimistically, waiting for the relay
    Pending,
    Confirmed,
    /// The relay refused the send, or it never got an answer
    Failed { reason: String },
}

/// Text the local user is about to send
#[derive(Debug, Clone)]
pub struct Draft {
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub body: String,
}

/// One line of the visible message list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEntry {
    /// Set for entries that originated locally
    #[serde(skip)]
    pub provisional: Option<ProvisionalId>,
    /// Set once the relay has confirmed the message
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

impl ChatEntry {
    pub(crate) fn confirmed(message: Message) -> Self {
        Self {
            provisional: None,
            id: Some(message.id),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body,
            created_at: message.created_at,
            status: DeliveryStatus::Confirmed,
        }
    }

    pub(crate) fn optimistic(provisional: ProvisionalId, draft: Draft) -> Self {
        Self {
            provisional: Some(provisional),
            id: None,
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            body: draft.body,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
        }
    }

    /// True when `user_id` wrote this entry
    pub fn is_own(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_order_independent() {
        let ab = ConversationId::placeholder("alice", "bob");
        let ba = ConversationId::placeholder("bob", "alice");
        assert_eq!(ab, ba);
        assert_eq!(ab.as_str(), "pending:alice:bob");
        assert!(ab.is_placeholder());
        assert!(!ConversationId::new("c-1").is_placeholder());
    }

    #[test]
    fn test_conversation_counterpart() {
        let conv = Conversation::new(ConversationId::new("c1"), "zed", "amy");
        assert_eq!(conv.participants, ["amy".to_string(), "zed".to_string()]);
        assert_eq!(conv.counterpart("amy"), Some("zed"));
        assert_eq!(conv.counterpart("zed"), Some("amy"));
        assert_eq!(conv.counterpart("bob"), None);
        assert!(conv.includes("zed"));
    }
}
