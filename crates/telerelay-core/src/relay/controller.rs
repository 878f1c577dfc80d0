//! Relay Controller
//!
//! Owns the lifecycle of the single forwarding task: start, stop, and the cleanup of every
//! chat message the task produced.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::state::{
    RelayError, RelayInner, RelaySession, RelayState, RelayStats, RelayStatus, StartOutcome,
    StopOutcome, TransientRefs, TransientSlot,
};
use super::worker::RelayWorker;
use crate::bus::MessageBus;
use crate::chat::{ChatId, ChatSurface, MessageId};

/// Starts and stops the bus → chat relay
///
/// At most one relay task runs at a time. Session, tracked message ids, transient UI refs and
/// stats share one lock; the worker's stop check goes through its `CancellationToken` and never
/// touches the lock.
///
/// # Example
///
/// ```ignore
/// let relay = RelayController::new(bus, chat);
///
/// relay.start("vadlap/topic", chat_id).await?;
/// // ... payloads are posted into the chat ...
/// relay.stop(chat_id).await; // deletes every forwarded message
/// ```
pub struct RelayController {
    bus: Arc<dyn MessageBus>,
    chat: Arc<dyn ChatSurface>,
    inner: Arc<Mutex<RelayInner>>,
}

impl RelayController {
    pub fn new(bus: Arc<dyn MessageBus>, chat: Arc<dyn ChatSurface>) -> Self {
        Self {
            bus,
            chat,
            inner: Arc::new(Mutex::new(RelayInner::default())),
        }
    }

    /// Start relaying `topic` into `chat_id`
    ///
    /// A no-op when a relay is already running. A subscription failure leaves the controller
    /// Idle and is returned to the caller.
    pub async fn start(&self, topic: &str, chat_id: ChatId) -> Result<StartOutcome, RelayError> {
        let mut inner = self.inner.lock().await;

        if let Some(session) = &inner.session
            && !session.cancel.is_cancelled()
        {
            info!(
                run_id = %session.run_id,
                topic,
                chat_id,
                "Relay already running"
            );
            return Ok(StartOutcome::AlreadyRunning);
        }

        // A session with a cancelled token only survives here when its worker ended on its own
        if let Some(dead) = inner.session.take() {
            warn!(run_id = %dead.run_id, "Reaping relay whose subscription ended");
            self.delete_tracked(&mut inner, dead.run_id, dead.chat_id)
                .await;
            inner.stats.stops += 1;
        }

        let payloads = match self.bus.subscribe(topic).await {
            Ok(payloads) => payloads,
            Err(source) => {
                warn!(topic, chat_id, error = %source, "Relay subscription failed");
                return Err(RelayError::Subscribe {
                    topic: topic.to_string(),
                    source,
                });
            }
        };

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let worker = RelayWorker {
            run_id,
            topic: topic.to_string(),
            chat_id,
            cancel: cancel.clone(),
            chat: self.chat.clone(),
            inner: self.inner.clone(),
        };
        let handle = tokio::spawn(worker.run(payloads));

        inner.session = Some(RelaySession {
            run_id,
            topic: topic.to_string(),
            chat_id,
            started_at: Utc::now(),
            cancel,
            worker: handle,
        });
        inner.stats.starts += 1;
        info!(run_id = %run_id, topic, chat_id, "Relay started");

        Ok(StartOutcome::Started { run_id })
    }

    /// Stop the running relay and delete every message it posted
    ///
    /// Calling this while Idle only logs. Messages are deleted from the chat the relay was
    /// started for.
    pub async fn stop(&self, chat_id: ChatId) -> StopOutcome {
        self.stop_inner(Some(chat_id)).await
    }

    /// Stop using the running session's own chat (process exit path)
    pub async fn shutdown(&self) -> StopOutcome {
        self.stop_inner(None).await
    }

    async fn stop_inner(&self, requested_chat: Option<ChatId>) -> StopOutcome {
        let (outcome, worker) = {
            let mut inner = self.inner.lock().await;
            inner.stats.stop_requests += 1;

            let Some(session) = inner.session.take() else {
                info!(chat_id = ?requested_chat, "Relay not running, nothing to stop");
                return StopOutcome::NotRunning;
            };

            if !session.cancel.is_cancelled() {
                session.cancel.cancel();
            }

            if let Some(chat_id) = requested_chat
                && chat_id != session.chat_id
            {
                warn!(
                    run_id = %session.run_id,
                    requested = chat_id,
                    relay_chat = session.chat_id,
                    "Stop requested from another chat, cleaning up the relay chat"
                );
            }

            let (deleted, failed) = self
                .delete_tracked(&mut inner, session.run_id, session.chat_id)
                .await;
            inner.stats.stops += 1;
            info!(run_id = %session.run_id, deleted, failed, "Relay stopped");

            (
                StopOutcome::Stopped {
                    run_id: session.run_id,
                    deleted,
                    failed,
                },
                session.worker,
            )
        };

        if let Err(e) = worker.await {
            warn!(error = %e, "Relay worker did not exit cleanly");
        }

        outcome
    }

    /// Best-effort delete of every tracked id, in send order. Returns (deleted, failed).
    async fn delete_tracked(
        &self,
        inner: &mut RelayInner,
        run_id: Uuid,
        chat_id: ChatId,
    ) -> (usize, usize) {
        let tracked = std::mem::take(&mut inner.tracked);
        let mut deleted = 0;
        let mut failed = 0;

        for message_id in tracked {
            match self.chat.delete(chat_id, message_id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    failed += 1;
                    inner.stats.delete_failures += 1;
                    warn!(
                        run_id = %run_id,
                        chat_id,
                        message_id,
                        error = %e,
                        "Failed to delete relayed message"
                    );
                }
            }
        }

        (deleted, failed)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.state() == RelayState::Running
    }

    pub async fn status(&self) -> RelayStatus {
        self.inner.lock().await.status()
    }

    pub async fn stats(&self) -> RelayStats {
        self.inner.lock().await.stats
    }

    /// Ids of the messages posted by the current relay, in send order
    pub async fn tracked_messages(&self) -> Vec<MessageId> {
        self.inner.lock().await.tracked.clone()
    }

    /// Take the transient refs, leaving both slots empty
    pub async fn take_transient(&self) -> TransientRefs {
        std::mem::take(&mut self.inner.lock().await.transient)
    }

    /// Record a transient message, returning whatever occupied the slot before
    pub async fn record_transient(
        &self,
        slot: TransientSlot,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Option<(ChatId, MessageId)> {
        let mut inner = self.inner.lock().await;
        let target = match slot {
            TransientSlot::Mode => &mut inner.transient.mode,
            TransientSlot::Data => &mut inner.transient.data,
        };
        target.replace((chat_id, message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, LocalBus};
    use crate::testkit::{RecordingChat, ScriptedBus};
    use std::time::Duration;

    fn controller() -> (RelayController, Arc<ScriptedBus>, Arc<RecordingChat>) {
        let bus = Arc::new(ScriptedBus::new());
        let chat = Arc::new(RecordingChat::new());
        (
            RelayController::new(bus.clone(), chat.clone()),
            bus,
            chat,
        )
    }

    #[tokio::test]
    async fn test_start_forwards_payloads_in_order() {
        let (relay, bus, chat) = controller();

        let outcome = relay.start("t", 1).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert!(relay.is_running().await);

        bus.deliver("t", "p1").await;
        bus.deliver("t", "p2").await;
        chat.wait_for_sends(2, Duration::from_secs(2)).await;

        assert_eq!(chat.sent_texts(), vec!["p1", "p2"]);
        assert_eq!(relay.tracked_messages().await, chat.sent_ids());
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let (relay, bus, _chat) = controller();

        let first = relay.start("t", 1).await.unwrap();
        let second = relay.start("t", 1).await.unwrap();

        assert!(matches!(first, StartOutcome::Started { .. }));
        assert_eq!(second, StartOutcome::AlreadyRunning);
        assert_eq!(bus.subscribe_calls(), 1);
        assert_eq!(relay.stats().await.starts, 1);
    }

    #[tokio::test]
    async fn test_stop_deletes_tracked_in_send_order() {
        let (relay, bus, chat) = controller();
        relay.start("t", 1).await.unwrap();

        bus.deliver("t", "p1").await;
        bus.deliver("t", "p2").await;
        chat.wait_for_sends(2, Duration::from_secs(2)).await;
        let sent = chat.sent_ids();

        let outcome = relay.stop(1).await;
        assert!(matches!(
            outcome,
            StopOutcome::Stopped {
                deleted: 2,
                failed: 0,
                ..
            }
        ));
        assert_eq!(chat.deleted_ids(), sent);
        assert!(relay.tracked_messages().await.is_empty());
        assert_eq!(relay.status().await.state, RelayState::Idle);
    }

    #[tokio::test]
    async fn test_stop_when_idle_makes_no_chat_calls() {
        let (relay, _bus, chat) = controller();

        assert_eq!(relay.stop(1).await, StopOutcome::NotRunning);
        assert_eq!(relay.stop(1).await, StopOutcome::NotRunning);
        assert_eq!(chat.call_count(), 0);

        let stats = relay.stats().await;
        assert_eq!(stats.stop_requests, 2);
        assert_eq!(stats.stops, 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_keeps_idle() {
        let (relay, bus, chat) = controller();
        bus.set_fail_subscribe(true);

        let err = relay.start("t", 1).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Subscribe {
                source: BusError::Subscribe { .. },
                ..
            }
        ));
        assert!(!relay.is_running().await);
        assert_eq!(chat.call_count(), 0);

        bus.set_fail_subscribe(false);
        let outcome = relay.start("t", 1).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_abort_cleanup() {
        let (relay, bus, chat) = controller();
        relay.start("t", 1).await.unwrap();

        for payload in ["a", "b", "c"] {
            bus.deliver("t", payload).await;
        }
        chat.wait_for_sends(3, Duration::from_secs(2)).await;
        let sent = chat.sent_ids();
        chat.fail_delete(sent[1]);

        let outcome = relay.stop(1).await;
        assert!(matches!(
            outcome,
            StopOutcome::Stopped {
                deleted: 2,
                failed: 1,
                ..
            }
        ));
        assert_eq!(chat.delete_attempts(), sent);
        assert!(relay.tracked_messages().await.is_empty());
        assert_eq!(relay.stats().await.delete_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_send_is_skipped() {
        let (relay, bus, chat) = controller();
        relay.start("t", 1).await.unwrap();

        chat.set_fail_sends(true);
        bus.deliver("t", "lost").await;
        chat.wait_for_send_attempts(1, Duration::from_secs(2)).await;
        chat.set_fail_sends(false);
        bus.deliver("t", "kept").await;
        chat.wait_for_sends(1, Duration::from_secs(2)).await;

        assert_eq!(chat.sent_texts(), vec!["kept"]);
        assert_eq!(relay.tracked_messages().await.len(), 1);
        assert_eq!(relay.stats().await.send_failures, 1);
    }

    #[tokio::test]
    async fn test_no_forwarding_after_stop() {
        let (relay, bus, chat) = controller();
        relay.start("t", 1).await.unwrap();
        bus.deliver("t", "before").await;
        chat.wait_for_sends(1, Duration::from_secs(2)).await;

        relay.stop(1).await;
        bus.deliver("t", "after").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(chat.sent_texts(), vec!["before"]);
        assert!(relay.tracked_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop_uses_fresh_subscription() {
        let (relay, bus, chat) = controller();

        let first = relay.start("t", 1).await.unwrap();
        relay.stop(1).await;
        let second = relay.start("t", 1).await.unwrap();

        let (StartOutcome::Started { run_id: a }, StartOutcome::Started { run_id: b }) =
            (first, second)
        else {
            panic!("both starts should launch a worker");
        };
        assert_ne!(a, b);
        assert_eq!(bus.subscribe_calls(), 2);

        bus.deliver("t", "x").await;
        chat.wait_for_sends(1, Duration::from_secs(2)).await;
        assert_eq!(chat.sent_texts(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_stop_cleans_relay_chat_when_requested_elsewhere() {
        let (relay, bus, chat) = controller();
        relay.start("t", 7).await.unwrap();
        bus.deliver("t", "p").await;
        chat.wait_for_sends(1, Duration::from_secs(2)).await;

        relay.stop(99).await;
        assert_eq!(chat.delete_chats(), vec![7]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_relay() {
        let (relay, bus, chat) = controller();
        relay.start("t", 3).await.unwrap();
        bus.deliver("t", "p").await;
        chat.wait_for_sends(1, Duration::from_secs(2)).await;

        assert!(matches!(
            relay.shutdown().await,
            StopOutcome::Stopped { deleted: 1, .. }
        ));
        assert_eq!(relay.shutdown().await, StopOutcome::NotRunning);
    }

    /// Install a session whose bus stream ended on its own, with `tracked` left behind
    async fn install_ended_session(
        relay: &RelayController,
        chat: Arc<RecordingChat>,
        tracked: MessageId,
    ) {
        let ended: crate::bus::PayloadStream = Box::pin(futures::stream::empty::<bytes::Bytes>());
        relay.inner.lock().await.tracked.push(tracked);

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let worker = RelayWorker {
            run_id,
            topic: "t".to_string(),
            chat_id: 1,
            cancel: cancel.clone(),
            chat,
            inner: relay.inner.clone(),
        };
        let handle = tokio::spawn(worker.run(ended));
        relay.inner.lock().await.session = Some(RelaySession {
            run_id,
            topic: "t".to_string(),
            chat_id: 1,
            started_at: Utc::now(),
            cancel: cancel.clone(),
            worker: handle,
        });

        tokio::time::timeout(Duration::from_secs(2), cancel.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ended_subscription_is_reaped_on_next_start() {
        let bus = Arc::new(LocalBus::with_capacity(4));
        let chat = Arc::new(RecordingChat::new());
        let relay = RelayController::new(bus.clone(), chat.clone());
        install_ended_session(&relay, chat.clone(), 500).await;

        let outcome = relay.start("t", 1).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(chat.deleted_ids(), vec![500]);
        assert!(relay.tracked_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_ended_subscription_reports_idle_until_cleaned() {
        let bus = Arc::new(LocalBus::new());
        let chat = Arc::new(RecordingChat::new());
        let relay = RelayController::new(bus.clone(), chat.clone());
        install_ended_session(&relay, chat.clone(), 500).await;

        let status = relay.status().await;
        assert_eq!(status.state, RelayState::Idle);
        assert_eq!(status.tracked, 1);
        assert!(!relay.is_running().await);

        // The leftover message is still cleaned up by stop
        assert!(matches!(
            relay.stop(1).await,
            StopOutcome::Stopped { deleted: 1, .. }
        ));
        assert_eq!(chat.deleted_ids(), vec![500]);
        assert_eq!(relay.stop(1).await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_stop_during_in_flight_send() {
        let (relay, bus, chat) = controller();
        chat.set_send_delay(Duration::from_millis(200));
        relay.start("t", 1).await.unwrap();

        bus.deliver("t", "p1").await;
        bus.deliver("t", "p2").await;
        chat.wait_for_sends_started(1, Duration::from_secs(2)).await;

        // p1 is mid-send: stop waits for it, deletes it, and p2 is never sent
        let outcome = relay.stop(1).await;
        assert!(matches!(
            outcome,
            StopOutcome::Stopped {
                deleted: 1,
                failed: 0,
                ..
            }
        ));
        assert_eq!(chat.sent_texts(), vec!["p1"]);
        assert_eq!(chat.deleted_ids(), chat.sent_ids());
        assert!(relay.tracked_messages().await.is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(chat.sends_started(), 1);
        assert!(relay.tracked_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_transient_returns_previous() {
        let (relay, _bus, _chat) = controller();

        assert_eq!(relay.record_transient(TransientSlot::Mode, 1, 10).await, None);
        assert_eq!(
            relay.record_transient(TransientSlot::Mode, 1, 11).await,
            Some((1, 10))
        );
        relay.record_transient(TransientSlot::Data, 1, 12).await;

        let refs = relay.take_transient().await;
        assert_eq!(refs.mode, Some((1, 11)));
        assert_eq!(refs.data, Some((1, 12)));
        assert!(relay.take_transient().await.is_empty());
    }
}
