//! Protocol types for dispensad IPC
//!
//! This crate defines the stable API between dispensad and clients:
//! - Commands (requests from clients)
//! - Responses
//! - Events (service -> clients)
//! - Session status views
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
