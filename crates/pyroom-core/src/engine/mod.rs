//! The boundary to the external interpreter process.
//!
//! [`Engine`] is the raw collaborator: something that can be started, fed
//! code tagged with a token, and drained of the messages it emits.
//! [`EngineAdapter`] wraps one engine per session and owns everything the
//! rest of the core relies on: token generation, readiness, draining and
//! restart.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod adapter;
pub mod message;
pub mod process;

pub use adapter::EngineAdapter;
pub use message::{ExecutionState, KernelMessage, MessageKind};
pub use process::{InterpreterCommand, ProcessEngine, ProcessEngineFactory};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn interpreter: {0}")]
    Spawn(String),

    #[error("interpreter is not running")]
    Dead,

    #[error("interpreter was never started")]
    NotStarted,

    #[error("interpreter I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of waiting for the next message on an engine's output stream.
#[derive(Debug)]
pub enum Recv {
    Message(KernelMessage),
    /// Nothing arrived within the wait.
    Timeout,
    /// The output stream is gone; the engine will not produce more messages.
    Closed,
}

#[async_trait]
pub trait Engine: Send {
    /// Launch the interpreter and open its message channel.
    async fn start(&mut self) -> Result<(), EngineError>;

    /// Non-blocking liveness check of the underlying process.
    fn is_alive(&mut self) -> bool;

    /// Push `code` to the interpreter, tagged with `token`.
    async fn send_execute(&mut self, token: &str, code: &str) -> Result<(), EngineError>;

    /// Wait up to `timeout` for the next message.
    async fn recv(&mut self, timeout: Duration) -> Recv;

    /// Terminate the interpreter and release its channel. Must not fail.
    async fn shutdown(&mut self);
}

/// Builds one engine per session, rooted at the session workspace.
pub trait EngineFactory: Send + Sync {
    fn create(&self, workdir: &Path) -> Box<dyn Engine>;
}
