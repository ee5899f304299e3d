//! Persistent per-conversation interpreter sessions.
//!
//! A [`SessionManager`] maps caller-chosen conversation ids to long-lived
//! interpreter processes. Variables survive between calls until the session
//! is reset, ended, or reclaimed after inactivity.

pub mod config;
pub mod correlator;
pub mod deps;
pub mod engine;
pub mod error;
pub mod readiness;
pub mod session;
pub mod supervisor;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::ServiceConfig;
pub use error::{Error, ExecutionFailure, InstallFailureKind, Result};
pub use session::{SessionInfo, SessionManager, SessionManagerConfig};
pub use supervisor::IdleSweeper;
