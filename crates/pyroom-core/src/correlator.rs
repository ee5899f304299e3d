use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::message::{render_display, render_result};
use crate::engine::{EngineAdapter, ExecutionState, MessageKind, Recv};
use crate::error::{Error, Result};

/// Runs one piece of code on a ready adapter and collects the output that
/// belongs to it.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionCorrelator {
    message_timeout: Duration,
    drain_quiet: Duration,
}

impl ExecutionCorrelator {
    pub fn new(message_timeout: Duration, drain_quiet: Duration) -> Self {
        Self {
            message_timeout,
            drain_quiet,
        }
    }

    /// Execute `code` and return its textual output, trimmed.
    ///
    /// Only the idle status carrying this request's token completes the
    /// call. Messages tagged with any other token are skipped. The caller
    /// must hold exclusive access to the adapter for the whole call.
    pub async fn execute(&self, adapter: &mut EngineAdapter, code: &str) -> Result<String> {
        let stale = adapter.drain_pending(self.drain_quiet).await;
        if stale > 0 {
            debug!(conversation_id = %adapter.label(), discarded = stale, "Drained stale messages before execution");
        }

        let token = adapter.submit(code).await?;
        let mut output = Output::default();

        loop {
            let msg = match adapter.next_message(self.message_timeout).await {
                Recv::Message(msg) => msg,
                Recv::Timeout => {
                    adapter.mark_stale();
                    if adapter.is_alive() {
                        warn!(
                            conversation_id = %adapter.label(),
                            token = %token,
                            timeout_secs = self.message_timeout.as_secs_f64(),
                            "Timed out waiting for kernel output"
                        );
                        return Err(Error::ExecutionTimeout {
                            timeout: self.message_timeout,
                        });
                    }
                    warn!(conversation_id = %adapter.label(), token = %token, "Kernel died during execution");
                    return Err(Error::EngineDead);
                }
                Recv::Closed => {
                    adapter.mark_stale();
                    warn!(conversation_id = %adapter.label(), token = %token, "Kernel output stream closed during execution");
                    return Err(Error::EngineDead);
                }
            };

            if msg.belongs_elsewhere(&token) {
                debug!(
                    conversation_id = %adapter.label(),
                    msg_type = %msg.header.msg_type,
                    "Ignoring message for another request"
                );
                continue;
            }

            match msg.kind() {
                MessageKind::Stream { text, .. } => output.push_text(&text),
                MessageKind::ExecuteResult { data } => output.push_block(&render_result(&data)),
                MessageKind::DisplayData { data } => {
                    if let Some(rendered) = render_display(&data) {
                        output.push_block(&rendered);
                    }
                }
                MessageKind::Error(failure) => {
                    debug!(
                        conversation_id = %adapter.label(),
                        ename = %failure.ename,
                        "Execution raised an error"
                    );
                    return Err(Error::ExecutionError(failure));
                }
                MessageKind::Status(ExecutionState::Idle) if msg.parent_token() == Some(token.as_str()) => {
                    return Ok(output.finish());
                }
                MessageKind::Status(_) | MessageKind::Other(_) => {}
            }
        }
    }
}

/// Accumulates output in arrival order. Rendered values and display
/// placeholders always sit on their own line.
#[derive(Default)]
struct Output {
    text: String,
}

impl Output {
    fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    fn push_block(&mut self, block: &str) {
        if block.is_empty() {
            return;
        }
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(block);
        self.text.push('\n');
    }

    fn finish(self) -> String {
        self.text.trim().to_string()
    }
}
