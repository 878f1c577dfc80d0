//! Relay state types
//!
//! Everything in [`RelayInner`] lives behind the controller's single lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::BusError;
use crate::chat::{ChatId, MessageId};

/// Errors that cross the relay controller boundary
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to subscribe to '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BusError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Idle,
    Running,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { run_id: Uuid },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped {
        run_id: Uuid,
        deleted: usize,
        failed: usize,
    },
}

/// Which disposable acknowledgement a transient ref belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientSlot {
    /// Mode change confirmation or failure notice
    Mode,
    /// "Receiving data" confirmation
    Data,
}

/// Chat messages removed on the next operator command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransientRefs {
    pub mode: Option<(ChatId, MessageId)>,
    pub data: Option<(ChatId, MessageId)>,
}

impl TransientRefs {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.data.is_none()
    }

    /// Refs in deletion order
    pub fn iter(&self) -> impl Iterator<Item = (ChatId, MessageId)> + '_ {
        self.mode.iter().chain(self.data.iter()).copied()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub starts: u64,
    pub stop_requests: u64,
    pub stops: u64,
    pub forwarded: u64,
    pub send_failures: u64,
    pub delete_failures: u64,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub run_id: Option<Uuid>,
    pub topic: Option<String>,
    pub chat_id: Option<ChatId>,
    pub started_at: Option<DateTime<Utc>>,
    pub tracked: usize,
}

/// One Running interval
pub(crate) struct RelaySession {
    pub run_id: Uuid,
    pub topic: String,
    pub chat_id: ChatId,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub worker: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct RelayInner {
    /// `Some` while Running, and for an ended run until it is cleaned up
    pub session: Option<RelaySession>,
    pub tracked: Vec<MessageId>,
    pub transient: TransientRefs,
    pub stats: RelayStats,
}

impl RelayInner {
    /// Running only while the session's worker is live; a run whose bus stream ended reads as
    /// Idle even though its session is kept for cleanup.
    pub fn state(&self) -> RelayState {
        match &self.session {
            Some(session) if !session.cancel.is_cancelled() => RelayState::Running,
            _ => RelayState::Idle,
        }
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            state: self.state(),
            run_id: self.session.as_ref().map(|s| s.run_id),
            topic: self.session.as_ref().map(|s| s.topic.clone()),
            chat_id: self.session.as_ref().map(|s| s.chat_id),
            started_at: self.session.as_ref().map(|s| s.started_at),
            tracked: self.tracked.len(),
        }
    }
}
