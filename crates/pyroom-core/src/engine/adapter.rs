use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Engine, Recv};
use crate::error::{Error, Result};

/// Upper bound on one drain, for interpreters that never go quiet.
pub const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Owns one interpreter for one session.
///
/// The adapter keeps its own readiness flag: it is cleared whenever the
/// interpreter is (re)started or observed dead, and only the readiness
/// monitor sets it again.
pub struct EngineAdapter {
    engine: Box<dyn Engine>,
    label: String,
    ready: bool,
}

impl EngineAdapter {
    pub fn new(engine: Box<dyn Engine>, label: impl Into<String>) -> Self {
        Self {
            engine,
            label: label.into(),
            ready: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn start(&mut self) -> Result<()> {
        self.ready = false;
        self.engine.start().await.map_err(|e| {
            warn!(conversation_id = %self.label, error = %e, "Interpreter failed to start");
            Error::EngineStartFailure {
                message: e.to_string(),
            }
        })?;
        info!(conversation_id = %self.label, "Interpreter started");
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        self.engine.is_alive()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Forget readiness so the next access re-verifies the interpreter.
    pub fn mark_stale(&mut self) {
        if self.ready {
            debug!(conversation_id = %self.label, "Kernel readiness marked stale");
        }
        self.ready = false;
    }

    /// Send `code` and return the correlation token for its output.
    pub async fn submit(&mut self, code: &str) -> Result<String> {
        if !self.engine.is_alive() {
            self.ready = false;
            return Err(Error::EngineDead);
        }
        let token = Uuid::new_v4().to_string();
        if let Err(e) = self.engine.send_execute(&token, code).await {
            debug!(conversation_id = %self.label, error = %e, "Failed to send code to interpreter");
            self.ready = false;
            return Err(e.into());
        }
        Ok(token)
    }

    pub async fn next_message(&mut self, timeout: Duration) -> Recv {
        self.engine.recv(timeout).await
    }

    /// Discard everything already queued on the output stream. Stops at the
    /// first gap of `quiet` with no message, or after [`DRAIN_LIMIT`].
    pub async fn drain_pending(&mut self, quiet: Duration) -> usize {
        let deadline = Instant::now() + DRAIN_LIMIT;
        let mut discarded = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    conversation_id = %self.label,
                    discarded,
                    "Interpreter kept producing output, giving up on drain"
                );
                break;
            }
            let Recv::Message(msg) = self.engine.recv(quiet.min(remaining)).await else {
                break;
            };
            debug!(
                conversation_id = %self.label,
                msg_type = %msg.header.msg_type,
                "Discarding stale kernel message"
            );
            discarded += 1;
        }
        discarded
    }

    /// Replace the interpreter in place. Readiness must be re-established
    /// by the caller afterwards.
    pub async fn restart(&mut self) -> Result<()> {
        info!(conversation_id = %self.label, "Restarting interpreter");
        self.ready = false;
        self.engine.shutdown().await;
        self.engine.start().await.map_err(|e| {
            warn!(conversation_id = %self.label, error = %e, "Interpreter restart failed");
            Error::RestartFailure {
                message: e.to_string(),
            }
        })
    }

    pub async fn shutdown(&mut self) {
        self.ready = false;
        self.engine.shutdown().await;
        debug!(conversation_id = %self.label, "Interpreter shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeEngine, FakeKernelControl};

    fn adapter() -> (EngineAdapter, FakeKernelControl) {
        let control = FakeKernelControl::default();
        let engine = FakeEngine::new(control.clone());
        (EngineAdapter::new(Box::new(engine), "test"), control)
    }

    #[tokio::test]
    async fn test_submit_before_start_is_engine_dead() {
        let (mut adapter, _control) = adapter();
        let result = adapter.submit("x = 1").await;
        assert!(matches!(result, Err(Error::EngineDead)));
    }

    #[tokio::test]
    async fn test_start_failure_maps_to_engine_start_failure() {
        let (mut adapter, control) = adapter();
        control.fail_next_starts(1);
        let result = adapter.start().await;
        assert!(matches!(result, Err(Error::EngineStartFailure { .. })));
    }

    #[tokio::test]
    async fn test_drain_discards_queued_messages() {
        let (mut adapter, control) = adapter();
        adapter.start().await.unwrap();
        control.inject(crate::engine::KernelMessage::stream(Some("old"), "stale\n"));
        control.inject(crate::engine::KernelMessage::status(Some("old"), "idle"));

        let drained = adapter.drain_pending(Duration::from_millis(10)).await;
        // two injected plus the startup status
        assert_eq!(drained, 3);
        assert_eq!(adapter.drain_pending(Duration::from_millis(10)).await, 0);
    }

    /// Emits a stray stream message every millisecond, forever.
    struct ChattyEngine;

    #[async_trait::async_trait]
    impl Engine for ChattyEngine {
        async fn start(&mut self) -> std::result::Result<(), crate::engine::EngineError> {
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            true
        }

        async fn send_execute(
            &mut self,
            _token: &str,
            _code: &str,
        ) -> std::result::Result<(), crate::engine::EngineError> {
            Ok(())
        }

        async fn recv(&mut self, _timeout: Duration) -> Recv {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Recv::Message(crate::engine::KernelMessage::stream(Some("loop"), "tick\n"))
        }

        async fn shutdown(&mut self) {}
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_endless_output() {
        let mut adapter = EngineAdapter::new(Box::new(ChattyEngine), "chatty");

        let started = Instant::now();
        let drained = adapter.drain_pending(Duration::from_millis(50)).await;
        let elapsed = started.elapsed();

        assert!(drained > 0);
        assert!(elapsed >= DRAIN_LIMIT);
        assert!(elapsed < DRAIN_LIMIT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_restart_clears_readiness_and_revives() {
        let (mut adapter, control) = adapter();
        adapter.start().await.unwrap();
        adapter.mark_ready();
        control.kill();
        assert!(!adapter.is_alive());

        adapter.restart().await.unwrap();
        assert!(adapter.is_alive());
        assert!(!adapter.is_ready());
        assert_eq!(control.start_count(), 2);
    }

    #[tokio::test]
    async fn test_restart_failure_is_reported() {
        let (mut adapter, control) = adapter();
        adapter.start().await.unwrap();
        control.fail_next_starts(1);
        let result = adapter.restart().await;
        assert!(matches!(result, Err(Error::RestartFailure { .. })));
    }
}
