//! Command types for the dispensad protocol

use dispensa_util::{CaseId, ClientId, OwnerId, SessionId, SubjectId, TaskId};
use serde::{Deserialize, Serialize};

use crate::{CaseView, HealthStatus, RecoveryBudget, SessionStatusView, API_VERSION};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
///
/// The session codes are business rejections; none of them is worth
/// retrying without a change of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UnknownSession,
    UnknownTask,
    UnknownCase,
    AlreadyStarted,
    SessionNotActive,
    NotLost,
    RecoveryDenied,
    InvalidCounselling,
    RateLimited,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create a session for a catalog case (starts out waiting)
    CreateSession {
        owner_id: OwnerId,
        subject_id: SubjectId,
        case_id: CaseId,
    },

    /// Start the clock on a waiting session
    Start { session_id: SessionId },

    /// Mark a subtask as done
    CompleteTask {
        session_id: SessionId,
        task_id: TaskId,
    },

    /// Submit counselling instructions (completes the counsel task)
    Counsel {
        session_id: SessionId,
        instructions: Vec<String>,
    },

    /// Spend a recovery token on a lost session
    Recover { session_id: SessionId },

    /// Query session status
    GetStatus { session_id: SessionId },

    /// Query an owner's recovery budget
    GetRecoveryBudget { owner_id: OwnerId },

    /// List catalog cases
    ListCases,

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    UnsubscribeEvents,

    GetHealth,

    /// Ping for keepalive
    Ping,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    SessionCreated { session_id: SessionId },
    Status(SessionStatusView),
    RecoveryBudget(RecoveryBudget),
    Cases(Vec<CaseView>),
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let session_id = SessionId::new();
        let req = Request::new(
            7,
            Command::CompleteTask {
                session_id,
                task_id: TaskId::new("billing"),
            },
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"complete_task\""));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 7);
        assert!(matches!(
            parsed.command,
            Command::CompleteTask { session_id: id, .. } if id == session_id
        ));
    }

    #[test]
    fn error_response_serialization() {
        let resp = Response::error(3, ErrorInfo::new(ErrorCode::RecoveryDenied, "no tokens left"));

        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("recovery_denied"));

        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 3);
        assert!(matches!(
            parsed.result,
            ResponseResult::Err(ErrorInfo { code: ErrorCode::RecoveryDenied, .. })
        ));
    }
}
