//! Core events emitted by the session engine

use chrono::{DateTime, Local};
use dispensa_util::{OwnerId, SessionId, TaskId};
use std::time::Duration;
use tokio::sync::mpsc;

/// Events emitted on session transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Waiting -> Active
    SessionStarted {
        session_id: SessionId,
        owner_id: OwnerId,
        deadline: DateTime<Local>,
    },

    TaskCompleted {
        session_id: SessionId,
        task_id: TaskId,
    },

    /// Every required task done before the deadline
    SessionRecovered {
        session_id: SessionId,
        owner_id: OwnerId,
        elapsed: Duration,
    },

    /// Deadline passed first
    SessionLost {
        session_id: SessionId,
        owner_id: OwnerId,
    },

    /// A recovery token put a lost session back into play
    SessionResumed {
        session_id: SessionId,
        owner_id: OwnerId,
        deadline: DateTime<Local>,
        tokens_remaining: u32,
    },
}

impl CoreEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            CoreEvent::SessionStarted { session_id, .. }
            | CoreEvent::TaskCompleted { session_id, .. }
            | CoreEvent::SessionRecovered { session_id, .. }
            | CoreEvent::SessionLost { session_id, .. }
            | CoreEvent::SessionResumed { session_id, .. } => session_id,
        }
    }
}

/// Notification hook for session transitions.
///
/// Called after the session lock is released; implementations must not
/// block for long.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: CoreEvent);
}

impl EventSink for mpsc::UnboundedSender<CoreEvent> {
    fn notify(&self, event: CoreEvent) {
        if self.send(event).is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: CoreEvent) {}
}
