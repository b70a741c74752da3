//! Instagram webhook envelope parser.
//!
//! One delivery can carry several entries, each with `changes` (comments) and/or
//! `messaging` (direct messages, story replies). Unknown change fields and echo
//! messages (sent by the account itself) are skipped, not rejected. Entries,
//! changes and messaging items are decoded one at a time: an item that does not
//! match the expected shape is logged and dropped while its siblings are kept.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::event::{CommentEvent, DirectMessageEvent, StoryReplyEvent, WebhookEvent};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported webhook object: {0}")]
    UnsupportedObject(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    object: String,
    #[serde(default)]
    entry: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    #[serde(default)]
    changes: Vec<serde_json::Value>,
    #[serde(default)]
    messaging: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Change {
    field: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CommentValue {
    id: String,
    text: Option<String>,
    from: Option<Actor>,
    media: Option<Media>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    id: String,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Media {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Messaging {
    sender: Participant,
    timestamp: Option<i64>,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Participant {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Message {
    mid: String,
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
    reply_to: Option<ReplyTo>,
}

#[derive(Debug, Deserialize)]
struct ReplyTo {
    story: Option<Story>,
}

#[derive(Debug, Deserialize)]
struct Story {
    id: String,
}

/// Decode one item of a delivery, logging and dropping it when it is malformed.
fn decode_item<T: DeserializeOwned>(value: serde_json::Value, item: &'static str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(item, error = %e, "skipping malformed webhook item");
            None
        }
    }
}

/// Parse a raw webhook body into typed events.
///
/// Returns an empty list for deliveries that contain nothing the queue handles
/// (reads, reactions, unknown change fields). Only a body that is not JSON, or
/// whose envelope is not an Instagram object, is an error.
pub fn parse_instagram_webhook(body: &[u8]) -> Result<Vec<WebhookEvent>, ParseError> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    if envelope.object != "instagram" && envelope.object != "page" {
        return Err(ParseError::UnsupportedObject(envelope.object));
    }

    let mut events = Vec::new();
    for entry in envelope.entry {
        let Some(entry) = decode_item::<Entry>(entry, "entry") else {
            continue;
        };
        for change in entry.changes {
            if let Some(event) = comment_event(&entry.id, change) {
                events.push(event);
            }
        }
        for messaging in entry.messaging {
            if let Some(event) = message_event(&entry.id, messaging) {
                events.push(event);
            }
        }
    }

    Ok(events)
}

fn comment_event(account_id: &str, change: serde_json::Value) -> Option<WebhookEvent> {
    let change = decode_item::<Change>(change, "change")?;
    if change.field != "comments" {
        return None;
    }
    let value = decode_item::<CommentValue>(change.value, "comment")?;
    let from = value.from?;
    // Comments the account itself posted come back as webhooks too.
    if from.id == account_id {
        return None;
    }
    Some(WebhookEvent::Comment(CommentEvent {
        account_id: account_id.to_string(),
        comment_id: value.id,
        media_id: value.media.map(|m| m.id),
        sender_id: from.id,
        sender_username: from.username,
        text: value.text,
        timestamp: value.timestamp,
    }))
}

fn message_event(account_id: &str, messaging: serde_json::Value) -> Option<WebhookEvent> {
    let messaging = decode_item::<Messaging>(messaging, "messaging")?;
    let message = messaging.message?;
    if message.is_echo {
        return None;
    }
    let story_id = message.reply_to.and_then(|r| r.story).map(|s| s.id);
    let event = match story_id {
        Some(story_id) => WebhookEvent::StoryReply(StoryReplyEvent {
            account_id: account_id.to_string(),
            message_id: message.mid,
            story_id,
            sender_id: messaging.sender.id,
            text: message.text,
            timestamp: messaging.timestamp,
        }),
        None => WebhookEvent::DirectMessage(DirectMessageEvent {
            account_id: account_id.to_string(),
            message_id: message.mid,
            sender_id: messaging.sender.id,
            text: message.text,
            timestamp: messaging.timestamp,
        }),
    };
    Some(event)
}
