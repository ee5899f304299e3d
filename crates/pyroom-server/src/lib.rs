//! HTTP transport for pyroom sessions.
//!
//! Routes:
//! - `POST /run` (JSON `{conversation_id, code, dependencies?}`) runs code.
//! - `POST /reset` (form `conversation_id`) restarts a session's kernel.
//! - `POST /end_session` (form `conversation_id`) ends a session.
//! - `GET /sessions` lists live sessions.
//!
//! Failures are returned as `{"detail": ...}` with a matching status.

pub mod api;
pub mod error;
pub mod host;
pub mod routes;

pub use error::ApiError;
pub use host::{DEFAULT_PORT, HostError, ServiceHost, ServiceHostConfig};
pub use routes::router;
