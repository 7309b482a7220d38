//! Error types for the session engine

use dispensa_util::TaskId;
use thiserror::Error;

/// Rejected session operations
///
/// All of these are business errors: synchronous, local, and not worth
/// retrying without a change in state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is not active")]
    SessionNotActive,

    #[error("Session is not lost")]
    NotLost,

    #[error("No recovery tokens left ({remaining} remaining)")]
    RecoveryDenied { remaining: u32 },

    #[error("Unknown session")]
    UnknownSession,

    #[error("Task is not part of this session")]
    UnknownTask,

    #[error("Duration budget must be positive and representable")]
    InvalidBudget,

    #[error("Counselling needs at least one instruction, or \"none\" on its own")]
    InvalidCounselling,

    #[error("Invalid task graph: {0}")]
    InvalidTaskGraph(#[from] TaskGraphError),
}

/// Problems building a task graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskGraphError {
    #[error("Task id must not be blank")]
    BlankTaskId,

    #[error("Task id {0} appears more than once")]
    DuplicateTask(TaskId),
}

pub type SessionResult<T> = Result<T, SessionError>;
