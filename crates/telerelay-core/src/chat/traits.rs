//! Chat Surface Trait
//!
//! The relay only needs a handful of operations from the chat it talks to: post a message and
//! learn its id, delete a message by id, answer a button press, and a stream of inbound events.

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use super::types::{ChatEvent, ChatId, MenuButton, MessageId};

/// Stream of inbound chat events
pub type ChatEventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Chat transport used by the relay and the mode switch
///
/// # Example
///
/// ```ignore
/// struct MyChat { /* ... */ }
///
/// #[async_trait]
/// impl ChatSurface for MyChat {
///     async fn send(&self, chat_id: ChatId, text: &str) -> Result<MessageId> {
///         // Post via API and return the new message id
///         Ok(1)
///     }
///
///     async fn delete(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
///         Ok(())
///     }
///
///     async fn acknowledge(&self, command_id: &str, text: &str) -> Result<()> {
///         Ok(())
///     }
///
///     fn start_receiving(&self) -> Option<ChatEventStream> {
///         None
///     }
/// }
/// ```
#[async_trait]
pub trait ChatSurface: Send + Sync {
    /// Post a text message and return its id
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<MessageId>;

    /// Delete a previously posted message
    async fn delete(&self, chat_id: ChatId, message_id: MessageId) -> Result<()>;

    /// Respond to a command without creating a persistent message
    async fn acknowledge(&self, command_id: &str, text: &str) -> Result<()>;

    /// Post a message with an inline keyboard
    ///
    /// Surfaces without keyboards fall back to plain text.
    async fn send_menu(
        &self,
        chat_id: ChatId,
        text: &str,
        rows: &[Vec<MenuButton>],
    ) -> Result<MessageId> {
        let _ = rows;
        self.send(chat_id, text).await
    }

    /// Longest text (in characters) a single message may carry
    fn max_message_len(&self) -> usize {
        4096
    }

    /// Start receiving inbound events (None if the surface is send-only)
    ///
    /// The returned stream is driven by a background task owned by the surface.
    fn start_receiving(&self) -> Option<ChatEventStream>;
}
