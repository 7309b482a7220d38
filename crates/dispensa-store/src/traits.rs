//! Store trait definitions

use chrono::{DateTime, Local};
use dispensa_api::SessionStatus;
use dispensa_util::{CaseId, OwnerId, SessionId, SubjectId, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{AuditEvent, StoreResult};

/// Main store trait
pub trait Store: Send + Sync {
    // Audit log

    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Most recent first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Sessions

    /// Insert or update a session record.
    ///
    /// Returns `false` (and leaves the stored record alone) when the stored
    /// version is the same or newer.
    fn save_session(&self, record: &SessionRecord) -> StoreResult<bool>;

    fn load_session(&self, session_id: &SessionId) -> StoreResult<Option<SessionRecord>>;

    fn load_sessions(&self) -> StoreResult<Vec<SessionRecord>>;

    // Recovery ledger

    fn get_tokens_consumed(&self, owner_id: &OwnerId) -> StoreResult<u32>;

    /// Record consumption; the stored count never decreases
    fn set_tokens_consumed(&self, owner_id: &OwnerId, consumed: u32) -> StoreResult<()>;

    fn load_ledger(&self) -> StoreResult<Vec<(OwnerId, u32)>>;

    // Health

    fn is_healthy(&self) -> bool;
}

/// Persisted shape of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub owner_id: OwnerId,
    pub subject_id: SubjectId,
    pub case_id: Option<CaseId>,
    pub status: SessionStatus,
    pub duration_budget: Duration,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub completed_tasks: Vec<TaskId>,
    pub tasks: TaskGraphRecord,
    pub attempt: u32,
    pub recoveries: u32,
    pub version: u64,
}

/// Persisted shape of a task graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraphRecord {
    pub dispense: Vec<TaskId>,
    pub counsel: TaskId,
    pub billing: TaskId,
}
