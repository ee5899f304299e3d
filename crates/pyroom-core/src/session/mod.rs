//! Per-conversation sessions and the table that holds them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::engine::EngineAdapter;

pub mod manager;
pub mod registry;
mod teardown;

pub use manager::{SessionInfo, SessionManager, SessionManagerConfig, SweepOutcome};
pub use registry::{SessionRegistry, SessionSnapshot};

/// Longest stem taken from a conversation id for its workspace name.
const MAX_DIR_STEM: usize = 64;

/// One conversation's execution context.
///
/// The kernel slot mutex serializes every use of the interpreter: creation,
/// execution, restart and teardown all run while holding it. The close
/// signal lives outside the mutex so teardown can interrupt whoever holds it.
pub struct Session {
    conversation_id: String,
    workspace: PathBuf,
    created_at: DateTime<Utc>,
    closing: CancellationToken,
    pub(crate) kernel: Mutex<KernelSlot>,
}

pub(crate) enum KernelSlot {
    /// Registered but not initialized yet; whoever locks it first creates it.
    Pending,
    Live(LiveKernel),
    /// Torn down. The session must not be used again.
    Closed,
}

pub(crate) struct LiveKernel {
    pub(crate) adapter: EngineAdapter,
    /// Set once readiness and bootstrap have both succeeded.
    pub(crate) ready: bool,
}

impl Session {
    pub(crate) fn new(conversation_id: &str, sessions_root: &Path) -> Self {
        let dir = format!(
            "{}-{}",
            workspace_dir_name(conversation_id),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            conversation_id: conversation_id.to_string(),
            workspace: sessions_root.join(dir),
            created_at: Utc::now(),
            closing: CancellationToken::new(),
            kernel: Mutex::new(KernelSlot::Pending),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether teardown has started. A closing session accepts no new work.
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Whether some call currently holds the kernel.
    pub fn is_busy(&self) -> bool {
        self.kernel.try_lock().is_err()
    }

    /// Signal every holder of the kernel to give it up.
    pub(crate) fn begin_close(&self) {
        self.closing.cancel();
    }

    /// Resolves once teardown has started.
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }
}

/// Filesystem-safe stem for a conversation id. Ids are caller-supplied, so
/// anything outside `[A-Za-z0-9_-]` is replaced.
pub fn workspace_dir_name(conversation_id: &str) -> String {
    let stem: String = conversation_id
        .chars()
        .take(MAX_DIR_STEM)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "session".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_name_is_sanitized() {
        assert_eq!(workspace_dir_name("conv-1_a"), "conv-1_a");
        assert_eq!(workspace_dir_name("../../etc"), "______etc");
        assert_eq!(workspace_dir_name(""), "session");
        assert_eq!(workspace_dir_name(&"x".repeat(200)).len(), MAX_DIR_STEM);
    }

    #[test]
    fn test_workspace_lives_under_root() {
        let session = Session::new("a/b", Path::new("/srv/rooms"));
        assert_eq!(session.workspace().parent(), Some(Path::new("/srv/rooms")));
        let name = session.workspace().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("a_b-"));
        assert_eq!(name.len(), "a_b-".len() + 8);
    }
}
