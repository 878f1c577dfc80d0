//! Telegram Chat Surface
//!
//! Talks to the Telegram Bot API: posts and deletes messages, answers callback queries from
//! inline buttons, and long-polls `getUpdates` for operator input.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::traits::{ChatEventStream, ChatSurface};
use super::types::{ChatEvent, ChatId, CommandEvent, MenuButton, MessageId, truncate_chars};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";
/// Default timeout for Telegram API calls (seconds)
const API_TIMEOUT_SECS: u64 = 30;
/// Telegram rejects longer message texts
const MAX_MESSAGE_CHARS: usize = 4096;
/// Pause after a failed `getUpdates` call
const POLL_BACKOFF_SECS: u64 = 5;

/// Telegram surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather
    #[serde(default)]
    pub bot_token: String,
    /// Long-polling timeout in seconds (default: 60)
    #[serde(default = "default_polling_timeout")]
    pub polling_timeout: u32,
}

fn default_polling_timeout() -> u32 {
    60
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl TelegramConfig {
    /// Create a new config with just the bot token
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            polling_timeout: default_polling_timeout(),
        }
    }

    /// Set polling timeout
    pub fn with_polling_timeout(mut self, timeout: u32) -> Self {
        self.polling_timeout = timeout;
        self
    }
}

/// Telegram Bot API client
#[derive(Clone)]
pub struct TelegramSurface {
    config: TelegramConfig,
    client: Client,
    /// Whether polling is active
    polling_active: Arc<AtomicBool>,
    /// Last update ID for long-polling
    last_update_id: Arc<AtomicI64>,
}

impl TelegramSurface {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            polling_active: Arc::new(AtomicBool::new(false)),
            last_update_id: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Create with just bot token
    pub fn with_token(bot_token: impl Into<String>) -> Self {
        Self::new(TelegramConfig::new(bot_token))
    }

    pub fn is_configured(&self) -> bool {
        !self.config.bot_token.is_empty()
    }

    pub fn is_polling(&self) -> bool {
        self.polling_active.load(Ordering::SeqCst)
    }

    /// Ask the polling task to exit after its current `getUpdates` call
    pub fn stop_polling(&self) {
        self.polling_active.store(false, Ordering::SeqCst);
    }

    /// Get the API URL for a method
    fn api_url(&self, method: &str) -> String {
        format!("{}{}/{}", TELEGRAM_API_BASE, self.config.bot_token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(params)
            .timeout(timeout)
            .send()
            .await?;

        if response.status().is_success() {
            let api_response: TelegramResponse<T> = response.json().await?;
            if api_response.ok {
                api_response
                    .result
                    .ok_or_else(|| anyhow!("Telegram returned ok but no result"))
            } else {
                Err(anyhow!(
                    "Telegram API error: {}",
                    api_response.description.unwrap_or_default()
                ))
            }
        } else {
            let error = response.text().await.unwrap_or_default();
            Err(anyhow!("Telegram HTTP error ({}): {}", method, error))
        }
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<TelegramMessageResponse> {
        let mut params = serde_json::json!({
            "chat_id": chat_id,
            "text": truncate_chars(text, MAX_MESSAGE_CHARS),
        });
        if let Some(markup) = reply_markup {
            params["reply_markup"] = markup;
        }

        self.call(
            "sendMessage",
            &params,
            Duration::from_secs(API_TIMEOUT_SECS),
        )
        .await
    }

    /// Poll for updates using long-polling
    async fn poll_updates(&self) -> Result<Vec<TelegramUpdate>> {
        let offset = self.last_update_id.load(Ordering::SeqCst);
        let params = serde_json::json!({
            "offset": if offset > 0 { offset + 1 } else { 0 },
            "timeout": self.config.polling_timeout,
            "allowed_updates": ["message", "callback_query"],
        });

        let updates: Vec<TelegramUpdate> = self
            .call(
                "getUpdates",
                &params,
                Duration::from_secs(u64::from(self.config.polling_timeout) + 10),
            )
            .await?;

        if let Some(last) = updates.last() {
            self.last_update_id.store(last.update_id, Ordering::SeqCst);
        }

        Ok(updates)
    }

    /// Convert Telegram update to a chat event
    fn convert_update(update: TelegramUpdate) -> Option<ChatEvent> {
        if let Some(callback) = update.callback_query {
            let message = callback.message?;
            return Some(ChatEvent::Command(CommandEvent::new(
                callback.id,
                message.chat.id,
                callback.data.unwrap_or_default(),
            )));
        }

        let message = update.message?;
        let text = message.text?;
        Some(ChatEvent::Text {
            chat_id: message.chat.id,
            text,
        })
    }

    /// Test the connection by calling getMe
    pub async fn test_connection(&self) -> Result<TelegramUser> {
        self.call(
            "getMe",
            &serde_json::json!({}),
            Duration::from_secs(API_TIMEOUT_SECS),
        )
        .await
    }
}

fn inline_keyboard(rows: &[Vec<MenuButton>]) -> serde_json::Value {
    let keyboard: Vec<Vec<serde_json::Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| {
                    serde_json::json!({
                        "text": button.label,
                        "callback_data": button.data,
                    })
                })
                .collect()
        })
        .collect();

    serde_json::json!({ "inline_keyboard": keyboard })
}

#[async_trait]
impl ChatSurface for TelegramSurface {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<MessageId> {
        let sent = self.send_message(chat_id, text, None).await?;
        Ok(sent.message_id)
    }

    async fn delete(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        let params = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });
        let deleted: bool = self
            .call(
                "deleteMessage",
                &params,
                Duration::from_secs(API_TIMEOUT_SECS),
            )
            .await?;

        if deleted {
            Ok(())
        } else {
            Err(anyhow!("Telegram refused to delete message {}", message_id))
        }
    }

    async fn acknowledge(&self, command_id: &str, text: &str) -> Result<()> {
        let mut params = serde_json::json!({ "callback_query_id": command_id });
        if !text.is_empty() {
            params["text"] = serde_json::Value::String(text.to_string());
        }

        let _: bool = self
            .call(
                "answerCallbackQuery",
                &params,
                Duration::from_secs(API_TIMEOUT_SECS),
            )
            .await?;
        Ok(())
    }

    async fn send_menu(
        &self,
        chat_id: ChatId,
        text: &str,
        rows: &[Vec<MenuButton>],
    ) -> Result<MessageId> {
        let sent = self
            .send_message(chat_id, text, Some(inline_keyboard(rows)))
            .await?;
        Ok(sent.message_id)
    }

    fn max_message_len(&self) -> usize {
        MAX_MESSAGE_CHARS
    }

    fn start_receiving(&self) -> Option<ChatEventStream> {
        // One poller per surface
        if !self.is_configured() || self.polling_active.swap(true, Ordering::SeqCst) {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let surface = self.clone();

        tokio::spawn(async move {
            info!("Starting Telegram polling");

            while surface.polling_active.load(Ordering::SeqCst) {
                match surface.poll_updates().await {
                    Ok(updates) => {
                        for update in updates {
                            let update_id = update.update_id;
                            let Some(event) = Self::convert_update(update) else {
                                debug!(update_id, "Ignoring Telegram update");
                                continue;
                            };
                            if tx.send(event).is_err() {
                                warn!("Event receiver dropped, stopping polling");
                                surface.polling_active.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Telegram polling error: {}", e);
                        tokio::time::sleep(Duration::from_secs(POLL_BACKOFF_SECS)).await;
                    }
                }
            }

            info!("Telegram polling stopped");
        });

        Some(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }
}

// ============================================================================
// Telegram API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[allow(dead_code)]
    message_id: i64,
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    #[allow(dead_code)]
    from: TelegramUser,
    message: Option<TelegramMessage>,
    data: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramUser {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramMessageResponse {
    message_id: i64,
}
