//! Shared utilities for dispensa
//!
//! This crate provides:
//! - ID types (SessionId, OwnerId, SubjectId, TaskId, CaseId, ClientId)
//! - Time utilities (injectable clocks, monotonic instants, duration helpers)
//! - Rate limiting helpers
//! - Default paths for socket, data, and config files

mod ids;
mod paths;
mod rate_limit;
mod time;

pub use ids::*;
pub use paths::*;
pub use rate_limit::*;
pub use time::*;
