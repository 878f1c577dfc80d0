//! Chat Types
//!
//! Channel-agnostic types exchanged between the chat surface and the dispatcher.

use serde::{Deserialize, Serialize};

/// Chat (conversation) identifier
pub type ChatId = i64;

/// Identifier of a message the bot posted into a chat
pub type MessageId = i64;

/// An operator pressed one of the inline buttons
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Opaque id used to acknowledge the command (Telegram callback query id)
    pub command_id: String,
    /// Chat the button was pressed in
    pub chat_id: ChatId,
    /// Raw button payload
    pub data: String,
}

impl CommandEvent {
    pub fn new(command_id: impl Into<String>, chat_id: ChatId, data: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            chat_id,
            data: data.into(),
        }
    }
}

/// Inbound event from a chat surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Inline button press
    Command(CommandEvent),
    /// Plain text message (e.g. `/start`)
    Text { chat_id: ChatId, text: String },
}

impl ChatEvent {
    pub fn chat_id(&self) -> ChatId {
        match self {
            Self::Command(command) => command.chat_id,
            Self::Text { chat_id, .. } => *chat_id,
        }
    }
}

/// Inline keyboard button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuButton {
    pub label: String,
    pub data: String,
}

impl MenuButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Cut `text` down to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
