//! Shared types for the forwarding pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskMode;

// ── Inbound message ─────────────────────────────────────────────────

/// Unified inbound message event from a source listener.
///
/// Listeners convert their native update format into this struct. The
/// engine routes it by `source_id` to every task watching that channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel the message was posted in.
    pub source_id: i64,
    /// Channel-native message id.
    pub message_id: i64,
    /// Numeric sender id, when the platform exposes one.
    #[serde(default)]
    pub sender_id: Option<i64>,
    /// Sender handle without the leading `@`.
    #[serde(default)]
    pub sender_username: Option<String>,
    /// Message text, or the caption for media messages.
    #[serde(default)]
    pub text: Option<String>,
    /// Attached media, if any.
    #[serde(default)]
    pub media: Option<Media>,
    /// Whether the message was itself forwarded from elsewhere.
    #[serde(default)]
    pub forwarded: bool,
    /// Whether the message carries an inline keyboard.
    #[serde(default)]
    pub has_inline_buttons: bool,
    /// When the listener received the message.
    pub received_at: DateTime<Utc>,
    /// Listener-specific metadata, passed through untouched.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InboundMessage {
    /// Create a plain text message.
    pub fn text(source_id: i64, message_id: i64, text: impl Into<String>) -> Self {
        Self {
            source_id,
            message_id,
            sender_id: None,
            sender_username: None,
            text: Some(text.into()),
            media: None,
            forwarded: false,
            has_inline_buttons: false,
            received_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach media to the message.
    pub fn with_media(mut self, kind: MediaKind, file_id: impl Into<String>) -> Self {
        self.media = Some(Media {
            kind,
            file_id: file_id.into(),
        });
        self
    }

    /// Set the sender identity.
    pub fn with_sender(mut self, id: i64, username: Option<&str>) -> Self {
        self.sender_id = Some(id);
        self.sender_username = username.map(|u| u.trim_start_matches('@').to_string());
        self
    }

    /// The content kind used by media filters. Messages without media are `Text`.
    pub fn kind(&self) -> MediaKind {
        self.media.as_ref().map(|m| m.kind).unwrap_or(MediaKind::Text)
    }

    /// Text or caption, empty string if absent.
    pub fn body(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Message content as a source listener reports it, before routing adds
/// the source id and metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePayload {
    pub message_id: i64,
    pub sender_id: Option<i64>,
    pub sender_username: Option<String>,
    pub text: Option<String>,
    pub media: Option<Media>,
    pub forwarded: bool,
    pub has_inline_buttons: bool,
}

impl InboundMessage {
    /// Assemble an event from the parts passed to the inbound interface.
    pub fn from_payload(source_id: i64, payload: MessagePayload, metadata: serde_json::Value) -> Self {
        Self {
            source_id,
            message_id: payload.message_id,
            sender_id: payload.sender_id,
            sender_username: payload.sender_username,
            text: payload.text,
            media: payload.media,
            forwarded: payload.forwarded,
            has_inline_buttons: payload.has_inline_buttons,
            received_at: Utc::now(),
            metadata,
        }
    }
}

/// Media attachment reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    /// Platform file reference; copying media re-sends this id.
    pub file_id: String,
}

/// Kind of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    VideoNote,
    Sticker,
    Animation,
    Contact,
    Location,
    Venue,
    Poll,
    Dice,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::VideoNote => "video_note",
            Self::Sticker => "sticker",
            Self::Animation => "animation",
            Self::Contact => "contact",
            Self::Location => "location",
            Self::Venue => "venue",
            Self::Poll => "poll",
            Self::Dice => "dice",
        };
        write!(f, "{s}")
    }
}

// ── Outbound message ────────────────────────────────────────────────

/// How the sink should interpret `OutboundMessage::text`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    #[default]
    Plain,
    Html,
}

/// What pressing an inline button does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ButtonAction {
    /// Open a URL.
    Url(String),
    /// Send callback data back to the bot.
    Callback(String),
}

/// A rendered inline button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub action: ButtonAction,
}

/// Rewritten payload produced by the transform stage and handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub source_id: i64,
    pub source_message_id: i64,
    pub text: Option<String>,
    pub media: Option<Media>,
    pub parse_mode: ParseMode,
    /// Button rows to attach; empty means none.
    pub buttons: Vec<Vec<InlineButton>>,
    /// Drop the source message's own inline keyboard when copying.
    pub strip_source_buttons: bool,
}

impl OutboundMessage {
    /// Start an outbound payload as an unmodified copy of the inbound message.
    pub fn copy_of(message: &InboundMessage) -> Self {
        Self {
            source_id: message.source_id,
            source_message_id: message.message_id,
            text: message.text.clone(),
            media: message.media.clone(),
            parse_mode: ParseMode::Plain,
            buttons: Vec::new(),
            strip_source_buttons: false,
        }
    }

    pub fn body(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Per-target delivery flags passed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// Relay through the bot API or a user account session.
    pub mode: TaskMode,
    /// Deliver without a notification.
    pub silent: bool,
    /// Pin the message after sending.
    pub pin: bool,
    /// Render link previews.
    pub link_preview: bool,
}
