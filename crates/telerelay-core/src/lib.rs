//! telerelay core
//!
//! Relays telemetry published on a message bus into a chat, and lets an operator switch the
//! remote device between automatic and manual mode from the same chat.
//!
//! ```text
//! ChatSurface ──events──▶ CommandDispatcher ──▶ ModeSwitch ──▶ MessageBus.publish
//!      ▲                                            │
//!      │                                            ▼
//!      └──────── send / delete ◀──────────── RelayController ◀── MessageBus.subscribe
//! ```

pub mod bus;
pub mod chat;
pub mod config;
pub mod dispatch;
pub mod mode;
pub mod relay;
#[cfg(any(test, feature = "test-utils"))]
pub mod testkit;

pub use bus::{BusError, LocalBus, MessageBus, MqttBus, PayloadStream};
pub use chat::{ChatEvent, ChatId, ChatSurface, CommandEvent, MessageId, TelegramSurface};
pub use config::RelayConfig;
pub use dispatch::CommandDispatcher;
pub use mode::{DeviceMode, ModeCommand, ModeError, ModeSettings, ModeSwitch};
pub use relay::{
    RelayController, RelayError, RelayState, RelayStats, RelayStatus, StartOutcome, StopOutcome,
    TransientSlot,
};
