//! Session lifecycle engine for dispensad
//!
//! This crate is the heart of dispensad, containing:
//! - Task graphs (what has to be done to close a session)
//! - Session state machine (Waiting -> Active -> Recovered | Lost, Lost -> Active on recovery)
//! - Deadline scheduling using monotonic time
//! - The per-owner recovery ledger
//! - The `SessionService` facade used by the daemon

mod error;
mod events;
mod ledger;
mod scheduler;
mod service;
mod session;
mod session_store;
mod task_graph;

pub use error::*;
pub use events::*;
pub use ledger::*;
pub use scheduler::*;
pub use service::*;
pub use session::*;
pub use session_store::*;
pub use task_graph::*;
