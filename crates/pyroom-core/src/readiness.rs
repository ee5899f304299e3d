use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{EngineAdapter, Recv};
use crate::error::{Error, Result};

/// Trivial code whose completed round trip proves the interpreter answers.
pub const PROBE_CODE: &str = "1+1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Starting,
    Ready,
    Failed,
}

/// Waits until a started interpreter actually executes code.
///
/// A live process is not enough: the interpreter's execution loop comes up
/// some time after the process does. The monitor submits [`PROBE_CODE`] and
/// waits for the idle status carrying the probe's token, polling liveness
/// while the process is not up yet.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessMonitor {
    timeout: Duration,
    poll_interval: Duration,
    drain_quiet: Duration,
}

impl ReadinessMonitor {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            drain_quiet: poll_interval,
        }
    }

    pub fn with_drain_quiet(mut self, quiet: Duration) -> Self {
        self.drain_quiet = quiet;
        self
    }

    /// Same monitor with a different overall bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Drive the monitor to a terminal state. On success the adapter is
    /// marked ready and left with an empty output stream.
    pub async fn wait_ready(&self, adapter: &mut EngineAdapter) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut state = ReadinessState::Starting;
        let mut probe: Option<String> = None;

        while state == ReadinessState::Starting {
            let now = Instant::now();
            if now >= deadline {
                state = ReadinessState::Failed;
                break;
            }
            let slice = self.poll_interval.min(deadline - now);

            if !adapter.is_alive() {
                probe = None;
                tokio::time::sleep(slice).await;
                continue;
            }

            let token = if let Some(token) = &probe {
                token.clone()
            } else {
                match adapter.submit(PROBE_CODE).await {
                    Ok(token) => {
                        probe = Some(token.clone());
                        token
                    }
                    Err(e) => {
                        debug!(conversation_id = %adapter.label(), error = %e, "Readiness probe not accepted yet");
                        tokio::time::sleep(slice).await;
                        continue;
                    }
                }
            };

            match adapter.next_message(slice).await {
                Recv::Message(msg) if msg.is_idle_for(&token) => state = ReadinessState::Ready,
                Recv::Message(_) | Recv::Timeout => {}
                Recv::Closed => {
                    probe = None;
                    tokio::time::sleep(slice).await;
                }
            }
        }

        if state == ReadinessState::Failed {
            warn!(
                conversation_id = %adapter.label(),
                timeout_secs = self.timeout.as_secs_f64(),
                "Kernel did not become ready"
            );
            return Err(Error::ReadinessTimeout {
                timeout: self.timeout,
            });
        }

        adapter.mark_ready();
        adapter.drain_pending(self.drain_quiet).await;
        info!(
            conversation_id = %adapter.label(),
            elapsed_ms = started.elapsed().as_millis(),
            "Kernel ready"
        );
        Ok(())
    }
}
