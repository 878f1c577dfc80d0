//! Command Dispatcher
//!
//! Single sequential loop turning inbound chat events into mode switch calls. Handling one
//! event at a time keeps relay start/stop requests from the chat strictly ordered.

use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatEvent, ChatEventStream, ChatId, ChatSurface, CommandEvent, truncate_chars};
use crate::mode::{ModeCommand, ModeSwitch};
use crate::relay::{RelayController, RelayState};

/// Callback answers are capped by the Bot API
const MAX_ACK_LEN: usize = 200;

const MENU_PROMPT: &str = "Choose an action:";

pub struct CommandDispatcher {
    chat: Arc<dyn ChatSurface>,
    modes: Arc<ModeSwitch>,
    relay: Arc<RelayController>,
}

impl CommandDispatcher {
    pub fn new(
        chat: Arc<dyn ChatSurface>,
        modes: Arc<ModeSwitch>,
        relay: Arc<RelayController>,
    ) -> Self {
        Self { chat, modes, relay }
    }

    /// Consume `events` until the stream ends or `shutdown` fires
    pub async fn run(&self, mut events: ChatEventStream, shutdown: CancellationToken) {
        info!("Command dispatcher started");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Command dispatcher shutting down");
                    break;
                }
                next = events.next() => match next {
                    Some(event) => event,
                    None => {
                        info!("Chat event stream ended");
                        break;
                    }
                },
            };

            if let Err(e) = self.handle_event(event).await {
                warn!(error = %e, "Failed to handle chat event");
            }
        }
    }

    pub async fn handle_event(&self, event: ChatEvent) -> Result<()> {
        match event {
            ChatEvent::Command(command) => self.handle_command(command).await,
            ChatEvent::Text { chat_id, text } => self.handle_text(chat_id, &text).await,
        }
    }

    async fn handle_command(&self, event: CommandEvent) -> Result<()> {
        debug!(chat_id = event.chat_id, data = %event.data, "Handling command");

        let Some(command) = ModeCommand::from_callback_data(&event.data) else {
            warn!(data = %event.data, "Unknown callback data");
            return self.chat.acknowledge(&event.command_id, "Unknown action").await;
        };

        let answer = match self.modes.execute(command, event.chat_id).await {
            Ok(text) => text,
            Err(e) => {
                warn!(?command, chat_id = event.chat_id, error = %e, "Command failed");
                let notice = format!("❌ {}", e);
                self.modes.post_notice(event.chat_id, &notice).await;
                notice
            }
        };

        self.chat
            .acknowledge(&event.command_id, truncate_chars(&answer, MAX_ACK_LEN))
            .await
    }

    async fn handle_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let command = text
            .split_whitespace()
            .next()
            .map(|word| word.split('@').next().unwrap_or(word).to_lowercase())
            .unwrap_or_default();

        match command.as_str() {
            "/start" | "/menu" => {
                self.chat
                    .send_menu(chat_id, MENU_PROMPT, &ModeCommand::menu())
                    .await?;
            }
            "/status" => {
                let text = self.status_text().await;
                self.chat.send(chat_id, &text).await?;
            }
            _ => debug!(chat_id, "Ignoring text message"),
        }
        Ok(())
    }

    async fn status_text(&self) -> String {
        let status = self.relay.status().await;
        let stats = self.relay.stats().await;

        let mut text = match status.state {
            RelayState::Running => format!(
                "🟢 Relay running\nTopic: {}\nMessages: {}",
                status.topic.as_deref().unwrap_or("-"),
                status.tracked
            ),
            RelayState::Idle => "⚪ Relay idle".to_string(),
        };
        if let Some(started_at) = status.started_at {
            text.push_str(&format!(
                "\nSince: {}",
                started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        text.push_str(&format!(
            "\nForwarded: {} ({} failed)",
            stats.forwarded, stats.send_failures
        ));
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeSettings;
    use crate::testkit::{ChatCall, RecordingChat, ScriptedBus};
    use std::time::Duration;

    struct Harness {
        dispatcher: CommandDispatcher,
        relay: Arc<RelayController>,
        bus: Arc<ScriptedBus>,
        chat: Arc<RecordingChat>,
    }

    fn harness() -> Harness {
        let bus = Arc::new(ScriptedBus::new());
        let chat = Arc::new(RecordingChat::new());
        let relay = Arc::new(RelayController::new(bus.clone(), chat.clone()));
        let modes = Arc::new(ModeSwitch::new(
            relay.clone(),
            bus.clone(),
            chat.clone(),
            ModeSettings::default(),
        ));
        Harness {
            dispatcher: CommandDispatcher::new(chat.clone(), modes, relay.clone()),
            relay,
            bus,
            chat,
        }
    }

    fn press(id: &str, chat_id: ChatId, data: &str) -> ChatEvent {
        ChatEvent::Command(CommandEvent::new(id, chat_id, data))
    }

    #[tokio::test]
    async fn test_button_press_acknowledged() {
        let h = harness();

        h.dispatcher
            .handle_event(press("cb-1", 1, "mode_auto"))
            .await
            .unwrap();

        assert_eq!(
            h.chat.acknowledgements(),
            vec![(
                "cb-1".to_string(),
                "✅ Automatic mode enabled".to_string()
            )]
        );
        assert_eq!(h.bus.published().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_callback() {
        let h = harness();

        h.dispatcher
            .handle_event(press("cb-1", 1, "something_else"))
            .await
            .unwrap();

        assert_eq!(
            h.chat.acknowledgements(),
            vec![("cb-1".to_string(), "Unknown action".to_string())]
        );
        assert!(h.bus.published().is_empty());
        assert_eq!(h.relay.stats().await.stop_requests, 0);
    }

    #[tokio::test]
    async fn test_failure_posts_notice() {
        let h = harness();
        h.bus.set_fail_subscribe(true);

        h.dispatcher
            .handle_event(press("cb-1", 1, "request_data"))
            .await
            .unwrap();

        let acks = h.chat.acknowledgements();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].1.starts_with("❌"));
        assert!(acks[0].1.chars().count() <= MAX_ACK_LEN);
        assert_eq!(h.chat.sent_texts().len(), 1);
        assert!(h.chat.sent_texts()[0].contains("vadlap/topic"));
        assert!(!h.relay.is_running().await);
    }

    #[tokio::test]
    async fn test_menu_commands() {
        let h = harness();

        h.dispatcher
            .handle_event(ChatEvent::Text {
                chat_id: 3,
                text: "/start".to_string(),
            })
            .await
            .unwrap();
        h.dispatcher
            .handle_event(ChatEvent::Text {
                chat_id: 3,
                text: "/menu@telerelay_bot".to_string(),
            })
            .await
            .unwrap();

        let menus: Vec<_> = h
            .chat
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ChatCall::Menu { .. }))
            .collect();
        assert_eq!(menus.len(), 2);
        assert_eq!(
            menus[0],
            ChatCall::Menu {
                chat_id: 3,
                text: MENU_PROMPT.to_string(),
                buttons: vec![
                    "mode_auto".to_string(),
                    "mode_hand".to_string(),
                    "request_data".to_string(),
                ],
            }
        );
    }

    #[tokio::test]
    async fn test_status_and_plain_text() {
        let h = harness();

        h.dispatcher
            .handle_event(ChatEvent::Text {
                chat_id: 3,
                text: "hello".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(h.chat.call_count(), 0);

        h.dispatcher
            .handle_event(ChatEvent::Text {
                chat_id: 3,
                text: "/status".to_string(),
            })
            .await
            .unwrap();
        assert!(h.chat.sent_texts()[0].starts_with("⚪ Relay idle"));

        h.relay.start("vadlap/topic", 3).await.unwrap();
        h.dispatcher
            .handle_event(ChatEvent::Text {
                chat_id: 3,
                text: "/STATUS".to_string(),
            })
            .await
            .unwrap();
        let texts = h.chat.sent_texts();
        assert!(texts[1].starts_with("🟢 Relay running"));
        assert!(texts[1].contains("Topic: vadlap/topic"));
    }

    #[tokio::test]
    async fn test_run_processes_events_in_order() {
        let bus = Arc::new(ScriptedBus::new());
        let (chat, events_tx) = RecordingChat::with_events();
        let chat = Arc::new(chat);
        let relay = Arc::new(RelayController::new(bus.clone(), chat.clone()));
        let modes = Arc::new(ModeSwitch::new(
            relay.clone(),
            bus.clone(),
            chat.clone(),
            ModeSettings::default(),
        ));
        let dispatcher = CommandDispatcher::new(chat.clone(), modes, relay.clone());

        let events = chat.start_receiving().unwrap();
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(events, shutdown).await })
        };

        events_tx.send(press("cb-1", 1, "request_data")).unwrap();
        events_tx.send(press("cb-2", 1, "mode_hand")).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while chat.acknowledgements().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "dispatcher stalled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!relay.is_running().await);
        let stats = relay.stats().await;
        assert_eq!(stats.starts, 1);
        assert_eq!(stats.stops, 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_ends_with_stream() {
        let h = harness();
        let events: ChatEventStream = Box::pin(futures::stream::iter(vec![press(
            "cb-1",
            1,
            "mode_hand",
        )]));

        h.dispatcher.run(events, CancellationToken::new()).await;
        assert_eq!(h.chat.acknowledgements().len(), 1);
    }
}
