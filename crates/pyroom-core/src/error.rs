use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;

pub type Result<T> = std::result::Result<T, Error>;

/// Structured detail of an error raised by caller code inside the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionFailure {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

/// Why the external install step for a dependency failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallFailureKind {
    /// The installer could not be launched at all.
    Spawn,
    /// The installer ran and exited unsuccessfully.
    ExitStatus,
    /// The installer did not finish within its time budget.
    TimedOut,
    /// The name was rejected before invoking the installer.
    Rejected,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Engine failed to start: {message}")]
    EngineStartFailure { message: String },

    #[error("Kernel did not become ready within {}s", timeout.as_secs_f64())]
    ReadinessTimeout { timeout: Duration },

    #[error("Kernel died. Please restart session.")]
    EngineDead,

    #[error("Code execution timed out waiting for response from kernel after {}s", timeout.as_secs_f64())]
    ExecutionTimeout { timeout: Duration },

    #[error("Execution error: {}: {}", .0.ename, .0.evalue)]
    ExecutionError(ExecutionFailure),

    #[error("Failed to restart kernel: {message}")]
    RestartFailure { message: String },

    #[error("Failed to initialize session '{conversation_id}': {source}")]
    SessionInitFailure {
        conversation_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error(
        "Kernel for session '{conversation_id}' could not be recovered ({reason}). Please start a new session."
    )]
    SessionUnrecoverable {
        conversation_id: String,
        reason: String,
    },

    #[error("Session '{conversation_id}' not found. Please start a new session or check the ID.")]
    SessionNotFound { conversation_id: String },

    #[error("Failed to install dependency '{package}': {message}")]
    DependencyInstallFailure {
        package: String,
        kind: InstallFailureKind,
        message: String,
    },

    #[error("Package '{package}' installed but failed to import in kernel: {source}")]
    DependencyImportFailure {
        package: String,
        import_name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn not_found(conversation_id: &str) -> Self {
        Self::SessionNotFound {
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn init_failure(conversation_id: &str, source: Error) -> Self {
        Self::SessionInitFailure {
            conversation_id: conversation_id.to_string(),
            source: Box::new(source),
        }
    }

    pub fn unrecoverable(conversation_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::SessionUnrecoverable {
            conversation_id: conversation_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Spawn(message) => Error::EngineStartFailure { message },
            EngineError::Dead | EngineError::NotStarted => Error::EngineDead,
            EngineError::Io(e) => Error::Io(e),
        }
    }
}
