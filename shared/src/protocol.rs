//! Chat frames and group events
//!
//! Clients send `{"message": "..."}` text frames and receive
//! `{"message": "...", "sender": "..."}` text frames. Between the two sits a
//! [`GroupEvent`], the unit the broadcast fabric fans out to subscribers.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Prefix of every per-user inbox group address
pub const GROUP_PREFIX: &str = "private_";

/// Inbox group address for a user.
///
/// All live connections owned by `username` subscribe to this address, so a
/// publish to it reaches every device of that user.
pub fn inbox_address(username: &str) -> String {
    format!("{}{}", GROUP_PREFIX, username)
}

/// A decoded inbound client frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundFrame {
    /// Chat text, if the frame carried a non-empty string `message`
    pub message: Option<String>,
}

impl InboundFrame {
    /// Text to persist and deliver, or `None` when the frame is a no-op
    pub fn chat_text(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Decode an inbound text frame.
///
/// Unknown keys are ignored. A missing, empty, or non-string `message`
/// yields a frame with no chat text rather than an error.
pub fn parse_inbound(text: &str) -> Result<InboundFrame> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    let message = obj
        .get("message")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    Ok(InboundFrame { message })
}

/// Event published to a group and delivered to each subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEvent {
    /// A private chat message
    ChatMessage {
        /// Message text
        message: String,
        /// Username of the author
        sender: String,
    },
}

impl GroupEvent {
    /// Build a chat message event
    pub fn chat_message(message: impl Into<String>, sender: impl Into<String>) -> Self {
        GroupEvent::ChatMessage {
            message: message.into(),
            sender: sender.into(),
        }
    }

    /// The client-facing frame for this event
    pub fn to_outbound(&self) -> OutboundFrame {
        match self {
            GroupEvent::ChatMessage { message, sender } => OutboundFrame {
                message: message.clone(),
                sender: sender.clone(),
            },
        }
    }
}

/// Frame written to a client socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    /// Message text
    pub message: String,
    /// Username of the author
    pub sender: String,
}

impl OutboundFrame {
    /// Serialize as a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
