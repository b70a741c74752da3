//! Inbound webhook events: typed payloads, envelope parsing and signature checks.

pub mod event;
pub mod parser;
pub mod signature;

pub use event::{
    COMMENT_PRIORITY, CONVERSATION_PRIORITY, CommentEvent, DirectMessageEvent, EventKind,
    StoryReplyEvent, WebhookEvent,
};
pub use parser::{ParseError, parse_instagram_webhook};
pub use signature::{SIGNATURE_HEADER, SignatureError, sign, verify_signature};
