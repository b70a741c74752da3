//! Typed inbound webhook events.
//!
//! The queue itself treats payloads as opaque JSON. At the ingestion boundary
//! every payload is one of a closed set of variants tagged by `kind`, so a
//! handler can dispatch with a `match` instead of probing loose JSON.

use serde::{Deserialize, Serialize};

use dmflow_core::Deduplicable;

/// Priority for direct messages and story replies (a person is waiting on a reply).
pub const CONVERSATION_PRIORITY: i32 = 10;
/// Priority for comments on media.
pub const COMMENT_PRIORITY: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Comment,
    DirectMessage,
    StoryReply,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Comment => "comment",
            EventKind::DirectMessage => "direct_message",
            EventKind::StoryReply => "story_reply",
        }
    }
}

/// A comment left on one of the account's media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEvent {
    /// Account (page) that received the webhook.
    pub account_id: String,
    pub comment_id: String,
    pub media_id: Option<String>,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub text: Option<String>,
    pub timestamp: Option<i64>,
}

/// An inbound direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessageEvent {
    pub account_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub timestamp: Option<i64>,
}

/// A direct message sent in reply to one of the account's stories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryReplyEvent {
    pub account_id: String,
    pub message_id: String,
    pub story_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub timestamp: Option<i64>,
}

/// Inbound webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookEvent {
    Comment(CommentEvent),
    DirectMessage(DirectMessageEvent),
    StoryReply(StoryReplyEvent),
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WebhookEvent::Comment(_) => EventKind::Comment,
            WebhookEvent::DirectMessage(_) => EventKind::DirectMessage,
            WebhookEvent::StoryReply(_) => EventKind::StoryReply,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            WebhookEvent::Comment(e) => &e.account_id,
            WebhookEvent::DirectMessage(e) => &e.account_id,
            WebhookEvent::StoryReply(e) => &e.account_id,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            WebhookEvent::Comment(e) => &e.sender_id,
            WebhookEvent::DirectMessage(e) => &e.sender_id,
            WebhookEvent::StoryReply(e) => &e.sender_id,
        }
    }

    /// Provider-assigned id of the comment or message.
    pub fn event_id(&self) -> &str {
        match self {
            WebhookEvent::Comment(e) => &e.comment_id,
            WebhookEvent::DirectMessage(e) => &e.message_id,
            WebhookEvent::StoryReply(e) => &e.message_id,
        }
    }

    /// Conversations outrank comments.
    pub fn default_priority(&self) -> i32 {
        match self.kind() {
            EventKind::DirectMessage | EventKind::StoryReply => CONVERSATION_PRIORITY,
            EventKind::Comment => COMMENT_PRIORITY,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: &serde_json::Value) -> serde_json::Result<Self> {
        Self::deserialize(payload)
    }
}

impl Deduplicable for WebhookEvent {
    /// Kind, sender and provider id. Timestamps and text are excluded so a
    /// redelivery with cosmetic differences hashes the same.
    fn dedup_fields(&self) -> Vec<String> {
        vec![
            self.kind().as_str().to_string(),
            self.sender_id().to_string(),
            self.event_id().to_string(),
        ]
    }
}
