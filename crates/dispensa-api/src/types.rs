//! Shared types for the dispensad API

use chrono::{DateTime, Local};
use dispensa_util::{CaseId, OwnerId, SessionId, SubjectId, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle status of a training session
///
/// `Recovered` is the successful outcome (the patient was treated in time)
/// and is final. `Lost` means the deadline passed first; it can be turned
/// back into `Active` by spending a recovery token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Recovered,
    Lost,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Recovered | SessionStatus::Lost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Recovered => "recovered",
            SessionStatus::Lost => "lost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(SessionStatus::Waiting),
            "active" => Some(SessionStatus::Active),
            "recovered" => Some(SessionStatus::Recovered),
            "lost" => Some(SessionStatus::Lost),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Dispense,
    Counsel,
    Billing,
}

/// Point-in-time view of a session, as returned by `get_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    pub owner_id: OwnerId,
    pub subject_id: SubjectId,
    pub case_id: Option<CaseId>,
    pub status: SessionStatus,
    /// How many times the session was armed (1 after start, +1 per recovery)
    pub attempt: u32,
    pub started_at: Option<DateTime<Local>>,
    pub deadline: Option<DateTime<Local>>,
    pub duration_budget: Duration,
    /// Time spent in the current attempt (frozen once the attempt ends)
    pub elapsed: Duration,
    /// Time left before the deadline, never negative
    pub remaining: Duration,
    /// Sorted
    pub completed_tasks: Vec<TaskId>,
    /// In stage order
    pub required_tasks: Vec<TaskId>,
    pub recovery_tokens_remaining: u32,
}

impl SessionStatusView {
    /// Required tasks not yet completed, in stage order
    pub fn outstanding_tasks(&self) -> Vec<&TaskId> {
        self.required_tasks
            .iter()
            .filter(|t| self.completed_tasks.binary_search(t).is_err())
            .collect()
    }
}

/// Case definition as presented to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseView {
    pub case_id: CaseId,
    pub label: String,
    pub duration_budget: Duration,
    pub required_tasks: Vec<TaskId>,
}

/// Recovery budget for one owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryBudget {
    pub remaining: u32,
    pub max_tokens: u32,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub catalog_loaded: bool,
    pub store_ok: bool,
    pub pending_deadlines: usize,
}
