//! Test doubles for the bus and chat seams.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::bus::{BusError, LocalBus, MessageBus, PayloadStream};
use crate::chat::{ChatEvent, ChatEventStream, ChatId, ChatSurface, MenuButton, MessageId};

/// One call made against [`RecordingChat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    Send {
        chat_id: ChatId,
        text: String,
        /// `None` when the send was made to fail
        message_id: Option<MessageId>,
    },
    Delete {
        chat_id: ChatId,
        message_id: MessageId,
        ok: bool,
    },
    Acknowledge {
        command_id: String,
        text: String,
    },
    Menu {
        chat_id: ChatId,
        text: String,
        buttons: Vec<String>,
    },
}

/// Chat surface that records every call and hands out sequential message ids
pub struct RecordingChat {
    calls: Mutex<Vec<ChatCall>>,
    next_id: AtomicI64,
    fail_sends: AtomicBool,
    send_delay: Mutex<Duration>,
    sends_started: AtomicUsize,
    failing_deletes: Mutex<HashSet<MessageId>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChatEvent>>>,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_sends: AtomicBool::new(false),
            send_delay: Mutex::new(Duration::ZERO),
            sends_started: AtomicUsize::new(0),
            failing_deletes: Mutex::new(HashSet::new()),
            events: Mutex::new(None),
        }
    }

    /// Surface with an inbound event stream fed by the returned sender
    pub fn with_events() -> (Self, mpsc::UnboundedSender<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chat = Self::new();
        *chat.events.lock() = Some(rx);
        (chat, tx)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every `send` take `delay` before it completes
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    /// Sends entered so far, including ones still in flight
    pub fn sends_started(&self) -> usize {
        self.sends_started.load(Ordering::SeqCst)
    }

    pub fn fail_delete(&self, message_id: MessageId) {
        self.failing_deletes.lock().insert(message_id);
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Texts of successful sends, in order
    pub fn sent_texts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChatCall::Send {
                    text,
                    message_id: Some(_),
                    ..
                } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Ids returned by successful sends, in order
    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChatCall::Send {
                    message_id: Some(id),
                    ..
                } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Every delete call's message id, successful or not
    pub fn delete_attempts(&self) -> Vec<MessageId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChatCall::Delete { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .collect()
    }

    /// Ids that were deleted successfully
    pub fn deleted_ids(&self) -> Vec<MessageId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChatCall::Delete {
                    message_id,
                    ok: true,
                    ..
                } => Some(*message_id),
                _ => None,
            })
            .collect()
    }

    pub fn delete_chats(&self) -> Vec<ChatId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChatCall::Delete { chat_id, .. } => Some(*chat_id),
                _ => None,
            })
            .collect()
    }

    pub fn acknowledgements(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChatCall::Acknowledge { command_id, text } => {
                    Some((command_id.clone(), text.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn send_attempts(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, ChatCall::Send { .. }))
            .count()
    }

    /// Wait until at least `count` sends succeeded
    pub async fn wait_for_sends(&self, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.sent_ids().len() < count {
            if Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {count} sends, saw {:?}",
                    self.sent_texts()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until at least `count` sends have begun
    pub async fn wait_for_sends_started(&self, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.sends_started() < count {
            if Instant::now() >= deadline {
                panic!("timed out waiting for {count} sends to begin");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Wait until at least `count` sends were attempted
    pub async fn wait_for_send_attempts(&self, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.send_attempts() < count {
            if Instant::now() >= deadline {
                panic!("timed out waiting for {count} send attempts");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for RecordingChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatSurface for RecordingChat {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<MessageId> {
        self.sends_started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_sends.load(Ordering::SeqCst) {
            self.calls.lock().push(ChatCall::Send {
                chat_id,
                text: text.to_string(),
                message_id: None,
            });
            return Err(anyhow!("injected send failure"));
        }

        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(ChatCall::Send {
            chat_id,
            text: text.to_string(),
            message_id: Some(message_id),
        });
        Ok(message_id)
    }

    async fn delete(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        let ok = !self.failing_deletes.lock().contains(&message_id);
        self.calls.lock().push(ChatCall::Delete {
            chat_id,
            message_id,
            ok,
        });
        if ok {
            Ok(())
        } else {
            Err(anyhow!("injected delete failure for {}", message_id))
        }
    }

    async fn acknowledge(&self, command_id: &str, text: &str) -> Result<()> {
        self.calls.lock().push(ChatCall::Acknowledge {
            command_id: command_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_menu(
        &self,
        chat_id: ChatId,
        text: &str,
        rows: &[Vec<MenuButton>],
    ) -> Result<MessageId> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(ChatCall::Menu {
            chat_id,
            text: text.to_string(),
            buttons: rows
                .iter()
                .flatten()
                .map(|button| button.data.clone())
                .collect(),
        });
        Ok(message_id)
    }

    fn start_receiving(&self) -> Option<ChatEventStream> {
        let rx = self.events.lock().take()?;
        Some(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }
}

/// [`LocalBus`] wrapper that records publishes and can refuse subscriptions or publishes
pub struct ScriptedBus {
    inner: LocalBus,
    published: Mutex<Vec<(String, Bytes)>>,
    subscribe_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
}

impl ScriptedBus {
    pub fn new() -> Self {
        Self {
            inner: LocalBus::new(),
            published: Mutex::new(Vec::new()),
            subscribe_calls: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
        }
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Publishes made through the `MessageBus` trait, as (topic, utf8 payload)
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .iter()
            .map(|(topic, payload)| {
                (
                    topic.clone(),
                    String::from_utf8_lossy(payload).into_owned(),
                )
            })
            .collect()
    }

    /// Inject a payload as if a device published it; not recorded in `published()`
    pub async fn deliver(&self, topic: &str, payload: &str) {
        self.inner
            .publish(topic, Bytes::copy_from_slice(payload.as_bytes()))
            .await
            .expect("local bus publish");
    }
}

impl Default for ScriptedBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for ScriptedBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }
        self.published
            .lock()
            .push((topic.to_string(), payload.clone()));
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BusError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: "injected subscribe failure".to_string(),
            });
        }
        self.inner.subscribe(topic).await
    }
}
