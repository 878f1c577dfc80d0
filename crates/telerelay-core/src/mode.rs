//! Mode Switch
//!
//! Maps the three operator commands onto the bus and the relay: entering a mode always stops
//! the relay first, then publishes the mode marker; requesting data starts the relay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{BusError, MessageBus};
use crate::chat::{ChatId, ChatSurface, MenuButton, MessageId};
use crate::relay::{RelayController, RelayError, StartOutcome, TransientSlot};

const DATA_ACK: &str = "📡 Receiving data";

#[derive(Debug, Error)]
pub enum ModeError {
    #[error("Failed to publish '{marker}' on '{topic}' after {attempts} attempts: {source}")]
    Publish {
        topic: String,
        marker: &'static str,
        attempts: u32,
        #[source]
        source: BusError,
    },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Operating mode of the remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Auto,
    Hand,
}

impl DeviceMode {
    /// Payload published on the mode topic
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Hand => "hand",
        }
    }

    pub fn confirmation(&self) -> &'static str {
        match self {
            Self::Auto => "✅ Automatic mode enabled",
            Self::Hand => "✅ Manual mode enabled",
        }
    }
}

/// Operator action behind an inline button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeCommand {
    EnterAuto,
    EnterHand,
    RequestData,
}

impl ModeCommand {
    pub const ALL: [ModeCommand; 3] = [Self::EnterAuto, Self::EnterHand, Self::RequestData];

    pub fn callback_data(&self) -> &'static str {
        match self {
            Self::EnterAuto => "mode_auto",
            Self::EnterHand => "mode_hand",
            Self::RequestData => "request_data",
        }
    }

    pub fn from_callback_data(data: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.callback_data() == data)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::EnterAuto => "Automatic mode",
            Self::EnterHand => "Manual mode",
            Self::RequestData => "Get data",
        }
    }

    /// Keyboard layout: both modes on the first row, data request below
    pub fn menu() -> Vec<Vec<MenuButton>> {
        let button = |command: ModeCommand| MenuButton::new(command.label(), command.callback_data());
        vec![
            vec![button(Self::EnterAuto), button(Self::EnterHand)],
            vec![button(Self::RequestData)],
        ]
    }
}

/// Topics and publish policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSettings {
    /// Topic the mode marker is published on
    #[serde(default = "default_mode_topic")]
    pub mode_topic: String,
    /// Topic relayed into the chat on a data request
    #[serde(default = "default_data_topic")]
    pub data_topic: String,
    /// How many times each mode marker is published
    #[serde(default = "default_publish_repeats")]
    pub publish_repeats: u32,
}

fn default_mode_topic() -> String {
    "mode/topic".to_string()
}

fn default_data_topic() -> String {
    "vadlap/topic".to_string()
}

fn default_publish_repeats() -> u32 {
    2
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            mode_topic: default_mode_topic(),
            data_topic: default_data_topic(),
            publish_repeats: default_publish_repeats(),
        }
    }
}

pub struct ModeSwitch {
    relay: Arc<RelayController>,
    bus: Arc<dyn MessageBus>,
    chat: Arc<dyn ChatSurface>,
    settings: ModeSettings,
}

impl ModeSwitch {
    pub fn new(
        relay: Arc<RelayController>,
        bus: Arc<dyn MessageBus>,
        chat: Arc<dyn ChatSurface>,
        settings: ModeSettings,
    ) -> Self {
        Self {
            relay,
            bus,
            chat,
            settings,
        }
    }

    /// Run the entry point for `command`, returning the acknowledgement text
    pub async fn execute(&self, command: ModeCommand, chat_id: ChatId) -> Result<String, ModeError> {
        match command {
            ModeCommand::EnterAuto => self.enter_auto(chat_id).await,
            ModeCommand::EnterHand => self.enter_hand(chat_id).await,
            ModeCommand::RequestData => self.request_data(chat_id).await,
        }
    }

    pub async fn enter_auto(&self, chat_id: ChatId) -> Result<String, ModeError> {
        self.enter_mode(DeviceMode::Auto, chat_id).await
    }

    pub async fn enter_hand(&self, chat_id: ChatId) -> Result<String, ModeError> {
        self.enter_mode(DeviceMode::Hand, chat_id).await
    }

    async fn enter_mode(&self, mode: DeviceMode, chat_id: ChatId) -> Result<String, ModeError> {
        self.clear_transient().await;
        // No relay may survive a mode change
        self.relay.stop(chat_id).await;
        self.publish_mode(mode).await?;

        let text = mode.confirmation();
        self.post_transient(chat_id, text, TransientSlot::Mode).await;
        Ok(text.to_string())
    }

    /// Publish the marker `publish_repeats` times; fails only if every attempt failed.
    async fn publish_mode(&self, mode: DeviceMode) -> Result<(), ModeError> {
        let topic = &self.settings.mode_topic;
        let attempts = self.settings.publish_repeats.max(1);
        let mut published = 0u32;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self
                .bus
                .publish(topic, Bytes::from_static(mode.marker().as_bytes()))
                .await
            {
                Ok(()) => {
                    published += 1;
                    info!(topic = %topic, marker = mode.marker(), attempt, "Published mode marker");
                }
                Err(e) => {
                    warn!(topic = %topic, marker = mode.marker(), attempt, error = %e, "Mode publish failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(source) if published == 0 => Err(ModeError::Publish {
                topic: topic.clone(),
                marker: mode.marker(),
                attempts,
                source,
            }),
            _ => Ok(()),
        }
    }

    pub async fn request_data(&self, chat_id: ChatId) -> Result<String, ModeError> {
        self.clear_transient().await;

        let outcome = self.relay.start(&self.settings.data_topic, chat_id).await?;
        if outcome == StartOutcome::AlreadyRunning {
            debug!(chat_id, "Data relay already active");
        }

        self.post_transient(chat_id, DATA_ACK, TransientSlot::Data)
            .await;
        Ok(DATA_ACK.to_string())
    }

    /// Show a failure notice that disappears with the next command
    pub async fn post_notice(&self, chat_id: ChatId, text: &str) {
        self.post_transient(chat_id, text, TransientSlot::Mode).await;
    }

    /// Delete the acknowledgements left by the previous command
    pub async fn clear_transient(&self) {
        let refs = self.relay.take_transient().await;
        for (chat_id, message_id) in refs.iter() {
            self.delete_quietly(chat_id, message_id).await;
        }
    }

    async fn post_transient(&self, chat_id: ChatId, text: &str, slot: TransientSlot) {
        match self.chat.send(chat_id, text).await {
            Ok(message_id) => {
                if let Some((old_chat, old_id)) = self
                    .relay
                    .record_transient(slot, chat_id, message_id)
                    .await
                {
                    self.delete_quietly(old_chat, old_id).await;
                }
            }
            Err(e) => warn!(chat_id, error = %e, "Failed to post acknowledgement"),
        }
    }

    async fn delete_quietly(&self, chat_id: ChatId, message_id: MessageId) {
        if let Err(e) = self.chat.delete(chat_id, message_id).await {
            warn!(chat_id, message_id, error = %e, "Failed to delete transient message");
        }
    }
}
