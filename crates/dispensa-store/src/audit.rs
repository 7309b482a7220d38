//! Audit event types

use chrono::{DateTime, Local};
use dispensa_util::{OwnerId, SessionId, SubjectId, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    ServiceStarted,

    ServiceStopped,

    /// Case catalog loaded
    CatalogLoaded { case_count: usize },

    SessionCreated {
        session_id: SessionId,
        owner_id: OwnerId,
        subject_id: SubjectId,
    },

    SessionStarted {
        session_id: SessionId,
        deadline: DateTime<Local>,
    },

    TaskCompleted {
        session_id: SessionId,
        task_id: TaskId,
    },

    /// All tasks done in time
    SessionRecovered {
        session_id: SessionId,
        elapsed: Duration,
    },

    SessionLost { session_id: SessionId },

    /// Recovery token spent on a lost session
    SessionResumed {
        session_id: SessionId,
        owner_id: OwnerId,
        tokens_remaining: u32,
    },

    RecoveryDenied {
        session_id: SessionId,
        owner_id: OwnerId,
    },

    ClientConnected {
        client_id: String,
        uid: Option<u32>,
    },

    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    pub timestamp: DateTime<Local>,

    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self::at(dispensa_util::now(), event)
    }

    /// Event stamped with a caller-supplied time (the engine's clock)
    pub fn at(timestamp: DateTime<Local>, event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp,
            event,
        }
    }
}
