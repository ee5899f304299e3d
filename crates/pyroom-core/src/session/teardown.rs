use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{KernelSlot, Session};

/// Release everything a detached session owns.
///
/// Each step logs its own failure and the next step runs regardless.
pub(super) async fn teardown(session: Arc<Session>, reason: &'static str) {
    let id = session.conversation_id();
    info!(conversation_id = %id, reason, "Tearing down session");

    session.begin_close();
    close_kernel(&session).await;
    remove_workspace(id, session.workspace()).await;

    debug!(conversation_id = %id, "Session teardown finished");
}

/// Mark the slot closed and stop its interpreter, if any. Whoever holds the
/// slot has already been told to let go.
async fn close_kernel(session: &Session) {
    let previous = {
        let mut slot = session.kernel.lock().await;
        std::mem::replace(&mut *slot, KernelSlot::Closed)
    };
    if let KernelSlot::Live(mut live) = previous {
        live.adapter.shutdown().await;
    }
}

pub(super) async fn remove_workspace(conversation_id: &str, workspace: &Path) {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => debug!(conversation_id = %conversation_id, path = %workspace.display(), "Removed session workspace"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(
            conversation_id = %conversation_id,
            path = %workspace.display(),
            error = %e,
            "Failed to remove session workspace"
        ),
    }
}
