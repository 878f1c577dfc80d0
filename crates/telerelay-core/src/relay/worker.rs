use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::RelayInner;
use crate::bus::PayloadStream;
use crate::chat::{ChatId, ChatSurface, truncate_chars};

/// Background task forwarding one subscription into one chat
pub(crate) struct RelayWorker {
    pub run_id: Uuid,
    pub topic: String,
    pub chat_id: ChatId,
    pub cancel: CancellationToken,
    pub chat: Arc<dyn ChatSurface>,
    pub inner: Arc<Mutex<RelayInner>>,
}

impl RelayWorker {
    pub async fn run(self, mut payloads: PayloadStream) {
        info!(
            run_id = %self.run_id,
            topic = %self.topic,
            chat_id = self.chat_id,
            "Relay worker started"
        );
        let max_len = self.chat.max_message_len();

        loop {
            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = payloads.next() => match next {
                    Some(payload) => payload,
                    None => {
                        warn!(run_id = %self.run_id, topic = %self.topic, "Bus subscription ended");
                        // Leaves the session in place for the next start() to reap
                        self.cancel.cancel();
                        break;
                    }
                },
            };

            let text = String::from_utf8_lossy(&payload);
            let text = truncate_chars(&text, max_len);

            // The lock is held across the send so stop() either sees this id or the run is
            // already cancelled and nothing is sent.
            let mut inner = self.inner.lock().await;
            if self.cancel.is_cancelled() {
                break;
            }

            match self.chat.send(self.chat_id, text).await {
                Ok(message_id) => {
                    inner.tracked.push(message_id);
                    inner.stats.forwarded += 1;
                    debug!(run_id = %self.run_id, message_id, "Forwarded bus payload");
                }
                Err(e) => {
                    inner.stats.send_failures += 1;
                    warn!(
                        run_id = %self.run_id,
                        chat_id = self.chat_id,
                        error = %e,
                        "Failed to forward payload, skipping"
                    );
                }
            }
        }

        info!(run_id = %self.run_id, "Relay worker stopped");
    }
}
