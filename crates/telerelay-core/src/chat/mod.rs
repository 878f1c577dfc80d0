//! Chat layer
//!
//! `ChatSurface` is the only view the relay has of the chat; `TelegramSurface` is the
//! production implementation.

pub mod telegram;
mod traits;
mod types;

pub use telegram::{TelegramConfig, TelegramSurface};
pub use traits::{ChatEventStream, ChatSurface};
pub use types::{ChatEvent, ChatId, CommandEvent, MenuButton, MessageId, truncate_chars};
