//! Event types for dispensad -> client streaming

use chrono::{DateTime, Local};
use dispensa_util::{OwnerId, SessionId, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::API_VERSION;

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: dispensa_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted {
        session_id: SessionId,
        owner_id: OwnerId,
        deadline: DateTime<Local>,
    },

    TaskCompleted {
        session_id: SessionId,
        task_id: TaskId,
    },

    /// All required tasks were completed before the deadline
    SessionRecovered {
        session_id: SessionId,
        owner_id: OwnerId,
        elapsed: Duration,
    },

    /// The deadline passed first
    SessionLost {
        session_id: SessionId,
        owner_id: OwnerId,
    },

    /// A recovery token put a lost session back on the clock
    SessionResumed {
        session_id: SessionId,
        owner_id: OwnerId,
        deadline: DateTime<Local>,
        tokens_remaining: u32,
    },

    /// Service is shutting down
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization() {
        let event = Event::new(EventPayload::SessionLost {
            session_id: SessionId::new(),
            owner_id: OwnerId::new("student-1"),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"session_lost\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.api_version, API_VERSION);
        assert!(matches!(parsed.payload, EventPayload::SessionLost { .. }));
    }
}
