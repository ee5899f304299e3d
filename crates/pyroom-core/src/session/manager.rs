use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::teardown::{remove_workspace, teardown};
use super::{KernelSlot, LiveKernel, Session, SessionRegistry};
use crate::config::ServiceConfig;
use crate::correlator::ExecutionCorrelator;
use crate::deps::{PackageInstaller, PipInstaller, install_dependencies};
use crate::engine::{EngineAdapter, EngineFactory, ProcessEngineFactory};
use crate::error::{Error, Result};
use crate::readiness::ReadinessMonitor;

/// Configuration for the SessionManager
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub sessions_root: PathBuf,
    pub bootstrap_code: String,
    pub readiness_timeout: Duration,
    /// Wait for an alive but not-ready kernel before falling back to restart.
    pub readiness_retry: Duration,
    pub poll_interval: Duration,
    pub message_timeout: Duration,
    pub drain_quiet: Duration,
    /// Sessions idle strictly longer than this are reclaimed by a sweep.
    pub idle_threshold: Duration,
}

impl SessionManagerConfig {
    pub fn new(sessions_root: impl Into<PathBuf>) -> Self {
        Self::from_service_config(&ServiceConfig::default().with_sessions_root(sessions_root))
    }

    pub fn from_service_config(config: &ServiceConfig) -> Self {
        let timeouts = &config.timeouts;
        Self {
            sessions_root: config.sessions_root(),
            bootstrap_code: config.bootstrap_code.clone(),
            readiness_timeout: timeouts.readiness(),
            readiness_retry: timeouts.readiness_retry(),
            poll_interval: timeouts.readiness_poll(),
            message_timeout: timeouts.message(),
            drain_quiet: timeouts.drain(),
            idle_threshold: config.gc.idle_threshold(),
        }
    }

    pub fn with_bootstrap_code(mut self, code: impl Into<String>) -> Self {
        self.bootstrap_code = code.into();
        self
    }

    pub fn with_readiness(mut self, timeout: Duration, retry: Duration) -> Self {
        self.readiness_timeout = timeout;
        self.readiness_retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_drain_quiet(mut self, quiet: Duration) -> Self {
        self.drain_quiet = quiet;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }
}

/// Summary of a live session, as listed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
}

/// Result of one idle sweep.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub reclaimed: Vec<String>,
    pub expired_tombstones: usize,
    teardowns: Vec<JoinHandle<()>>,
}

impl SweepOutcome {
    /// Wait for the teardowns started by the sweep.
    pub async fn join(self) {
        for handle in self.teardowns {
            if let Err(e) = handle.await {
                warn!(error = %e, "Session teardown task failed");
            }
        }
    }
}

/// Owns the session table and runs every session protocol: creation,
/// access checks and recovery, execution, reset, end, and idle reclamation.
pub struct SessionManager {
    config: SessionManagerConfig,
    registry: SessionRegistry,
    factory: Arc<dyn EngineFactory>,
    installer: Arc<dyn PackageInstaller>,
    readiness: ReadinessMonitor,
    correlator: ExecutionCorrelator,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        factory: Arc<dyn EngineFactory>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        let readiness = ReadinessMonitor::new(config.readiness_timeout, config.poll_interval)
            .with_drain_quiet(config.drain_quiet);
        let correlator = ExecutionCorrelator::new(config.message_timeout, config.drain_quiet);
        Self {
            config,
            registry: SessionRegistry::new(),
            factory,
            installer,
            readiness,
            correlator,
        }
    }

    /// Manager backed by real interpreter processes and the configured
    /// package installer.
    pub fn from_service_config(config: &ServiceConfig) -> Self {
        let factory = Arc::new(ProcessEngineFactory::new(config.interpreter.clone()));
        let installer = Arc::new(PipInstaller::new(
            config.installer.clone(),
            config.timeouts.install(),
        ));
        Self::new(
            SessionManagerConfig::from_service_config(config),
            factory,
            installer,
        )
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Run `code` in the session for `conversation_id`, creating the session
    /// if the id has never been seen. Dependencies are installed first, in
    /// order, and the first failure aborts the request.
    pub async fn run(
        &self,
        conversation_id: &str,
        code: &str,
        dependencies: &[String],
    ) -> Result<String> {
        // A session closed while this call waited for it is replaced once.
        for attempt in 0..2 {
            let (session, created) = self
                .registry
                .get_or_create(conversation_id, || {
                    Session::new(conversation_id, &self.config.sessions_root)
                })
                .await?;
            if created {
                info!(conversation_id = %conversation_id, "No existing session, creating one");
            }

            let mut slot = session.kernel.lock().await;
            if session.is_closing() || matches!(*slot, KernelSlot::Closed) {
                drop(slot);
                if attempt == 0 {
                    debug!(conversation_id = %conversation_id, "Session closed while waiting, retrying");
                    continue;
                }
                break;
            }

            let result = tokio::select! {
                biased;
                () = session.closed() => {
                    info!(conversation_id = %conversation_id, "Session closed during execution");
                    Err(Error::not_found(conversation_id))
                }
                result = self.run_locked(&session, &mut slot, code, dependencies) => result,
            };
            drop(slot);
            self.registry.touch(conversation_id).await;
            return result;
        }
        Err(Error::not_found(conversation_id))
    }

    async fn run_locked(
        &self,
        session: &Arc<Session>,
        slot: &mut KernelSlot,
        code: &str,
        dependencies: &[String],
    ) -> Result<String> {
        let live = self.ensure_live(session, slot).await?;
        let result = self.execute_with_dependencies(live, code, dependencies).await;
        live.ready &= live.adapter.is_ready();
        result
    }

    async fn execute_with_dependencies(
        &self,
        live: &mut LiveKernel,
        code: &str,
        dependencies: &[String],
    ) -> Result<String> {
        if !dependencies.is_empty() {
            install_dependencies(
                self.installer.as_ref(),
                &self.correlator,
                &mut live.adapter,
                dependencies,
            )
            .await?;
        }
        debug!(conversation_id = %live.adapter.label(), "Executing code");
        self.correlator.execute(&mut live.adapter, code).await
    }

    /// Restart the interpreter of an existing session and re-run the
    /// bootstrap code. All variables are lost.
    pub async fn reset(&self, conversation_id: &str) -> Result<()> {
        let session = self
            .registry
            .get(conversation_id)
            .await
            .ok_or_else(|| Error::not_found(conversation_id))?;
        let mut slot = session.kernel.lock().await;
        if session.is_closing() {
            return Err(Error::not_found(conversation_id));
        }

        tokio::select! {
            biased;
            () = session.closed() => Err(Error::not_found(conversation_id)),
            result = self.reset_locked(&session, &mut slot) => result,
        }
    }

    async fn reset_locked(&self, session: &Arc<Session>, slot: &mut KernelSlot) -> Result<()> {
        let conversation_id = session.conversation_id();
        let live = match &mut *slot {
            KernelSlot::Closed => return Err(Error::not_found(conversation_id)),
            // Creation gives the same fresh state a reset would.
            KernelSlot::Pending => {
                self.ensure_live(session, slot).await?;
                return Ok(());
            }
            KernelSlot::Live(live) => live,
        };

        info!(conversation_id = %conversation_id, "Resetting session kernel");
        live.ready = false;
        let outcome = match live.adapter.restart().await {
            Ok(()) => self
                .bring_up(&mut live.adapter)
                .await
                .map_err(|e| Error::init_failure(conversation_id, e)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                live.ready = true;
                info!(conversation_id = %conversation_id, "Session kernel reset");
                Ok(())
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Reset failed, destroying session");
                self.destroy(session, slot).await;
                Err(e)
            }
        }
    }

    /// Remove the session and release its resources. The id stays reserved
    /// until it expires from the ended list, so it is not recreated by a
    /// later `run`.
    pub async fn end_session(&self, conversation_id: &str) -> Result<()> {
        let session = self
            .registry
            .retire(conversation_id)
            .await
            .ok_or_else(|| Error::not_found(conversation_id))?;
        teardown(session, "ended").await;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut sessions: Vec<SessionInfo> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|s| SessionInfo {
                conversation_id: s.conversation_id,
                created_at: s.created_at,
                idle_secs: now.saturating_duration_since(s.last_activity).as_secs(),
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    pub async fn sweep_idle(&self) -> SweepOutcome {
        self.sweep_idle_at(Instant::now()).await
    }

    /// Reclaim every session idle strictly longer than the threshold at
    /// `now`. Teardowns run as independent tasks.
    pub async fn sweep_idle_at(&self, now: Instant) -> SweepOutcome {
        let threshold = self.config.idle_threshold;
        let candidates: Vec<String> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|s| now.saturating_duration_since(s.last_activity) > threshold)
            .map(|s| s.conversation_id)
            .collect();

        let mut outcome = SweepOutcome::default();
        for id in candidates {
            match self.registry.remove_if_idle(&id, now, threshold).await {
                Some(session) => {
                    info!(conversation_id = %id, "Session inactive for too long, scheduling cleanup");
                    outcome
                        .teardowns
                        .push(tokio::spawn(teardown(session, "idle")));
                    outcome.reclaimed.push(id);
                }
                None => {
                    debug!(conversation_id = %id, "Session already removed or active again, skipping");
                }
            }
        }

        outcome.expired_tombstones = self.registry.prune_retired(now, threshold).await;

        if !outcome.reclaimed.is_empty() {
            info!(count = outcome.reclaimed.len(), "Reclaimed idle sessions");
        }
        outcome
    }

    /// Tear down every session concurrently and wait for all of them.
    pub async fn shutdown_all(&self) {
        let sessions = self.registry.drain().await;
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Shutting down all sessions");

        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(teardown(session, "shutdown"));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Session teardown task failed");
            }
        }
    }

    /// Bring the slot to a usable live kernel: create it if pending, verify
    /// it if live. On failure the session has already been destroyed.
    async fn ensure_live<'a>(
        &self,
        session: &Arc<Session>,
        slot: &'a mut KernelSlot,
    ) -> Result<&'a mut LiveKernel> {
        let id = session.conversation_id();
        let failure = match slot {
            KernelSlot::Closed => return Err(Error::not_found(id)),
            KernelSlot::Pending => match self.initialize(session).await {
                Ok(live) => {
                    *slot = KernelSlot::Live(live);
                    None
                }
                Err(e) => Some(Error::init_failure(id, e)),
            },
            KernelSlot::Live(live) => self.verify(id, live).await.err(),
        };

        if let Some(e) = failure {
            warn!(conversation_id = %id, error = %e, "Session unusable, destroying it");
            self.destroy(session, slot).await;
            return Err(e);
        }

        match slot {
            KernelSlot::Live(live) => Ok(live),
            _ => Err(Error::not_found(id)),
        }
    }

    /// Creation protocol: workspace, start, readiness, bootstrap.
    async fn initialize(&self, session: &Session) -> Result<LiveKernel> {
        let id = session.conversation_id();
        info!(conversation_id = %id, workspace = %session.workspace().display(), "Creating session");

        tokio::fs::create_dir_all(session.workspace()).await?;
        let mut adapter = EngineAdapter::new(self.factory.create(session.workspace()), id);

        if let Err(e) = adapter.start().await {
            adapter.shutdown().await;
            return Err(e);
        }
        if let Err(e) = self.bring_up(&mut adapter).await {
            adapter.shutdown().await;
            return Err(e);
        }

        info!(conversation_id = %id, "Session created");
        Ok(LiveKernel {
            adapter,
            ready: true,
        })
    }

    /// Access protocol for an existing kernel.
    async fn verify(&self, id: &str, live: &mut LiveKernel) -> Result<()> {
        if !live.adapter.is_alive() {
            warn!(conversation_id = %id, "Kernel found dead, attempting restart");
            live.ready = false;
            return self.recover(id, live).await;
        }

        if !live.ready || !live.adapter.is_ready() {
            debug!(conversation_id = %id, "Kernel not ready, waiting");
            let retry = self.readiness.with_timeout(self.config.readiness_retry);
            if let Err(e) = retry.wait_ready(&mut live.adapter).await {
                warn!(conversation_id = %id, error = %e, "Kernel still not ready, attempting restart");
                return self.recover(id, live).await;
            }
            live.ready = true;
        }
        Ok(())
    }

    /// One restart, readiness and bootstrap cycle.
    async fn recover(&self, id: &str, live: &mut LiveKernel) -> Result<()> {
        live.ready = false;
        let attempt = match live.adapter.restart().await {
            Ok(()) => self.bring_up(&mut live.adapter).await,
            Err(e) => Err(e),
        };
        match attempt {
            Ok(()) => {
                live.ready = true;
                info!(conversation_id = %id, "Kernel recovered");
                Ok(())
            }
            Err(e) => Err(Error::unrecoverable(id, e)),
        }
    }

    /// Readiness followed by the bootstrap snippet.
    async fn bring_up(&self, adapter: &mut EngineAdapter) -> Result<()> {
        self.readiness.wait_ready(adapter).await?;
        if self.config.bootstrap_code.trim().is_empty() {
            return Ok(());
        }
        let output = self
            .correlator
            .execute(adapter, &self.config.bootstrap_code)
            .await?;
        debug!(conversation_id = %adapter.label(), output = %output, "Bootstrap code executed");
        Ok(())
    }

    /// Close the slot and drop the registry entry, then remove the workspace.
    async fn destroy(&self, session: &Arc<Session>, slot: &mut KernelSlot) {
        let id = session.conversation_id();
        if let KernelSlot::Live(mut live) = std::mem::replace(slot, KernelSlot::Closed) {
            live.adapter.shutdown().await;
        }
        self.registry.remove_exact(id, session).await;
        remove_workspace(id, session.workspace()).await;
    }
}
