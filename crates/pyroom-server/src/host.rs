use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pyroom_core::{IdleSweeper, ServiceConfig, SessionManager};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::routes::router;

pub const DEFAULT_PORT: u16 = 5002;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("Server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Configuration for the ServiceHost
#[derive(Debug, Clone)]
pub struct ServiceHostConfig {
    pub bind_addr: SocketAddr,
    /// How often the idle sweeper runs.
    pub sweep_interval: Duration,
}

impl ServiceHostConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            sweep_interval: Duration::from_secs(300),
        }
    }

    pub fn from_service_config(config: &ServiceConfig, bind_addr: SocketAddr) -> Self {
        Self::new(bind_addr).with_sweep_interval(config.gc.sweep_interval())
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Owns the HTTP listener task and the idle sweeper, and tears every
/// session down on shutdown.
pub struct ServiceHost {
    session_manager: Arc<SessionManager>,
    server_handle: Option<JoinHandle<std::io::Result<()>>>,
    sweeper_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
    config: ServiceHostConfig,
}

impl ServiceHost {
    pub fn new(config: ServiceHostConfig, session_manager: Arc<SessionManager>) -> Self {
        Self {
            session_manager,
            server_handle: None,
            sweeper_handle: None,
            shutdown_tx: None,
            local_addr: None,
            config,
        }
    }

    /// Bind the listener and start serving. Returns once the socket is bound.
    pub async fn start(&mut self) -> Result<SocketAddr, HostError> {
        if self.server_handle.is_some() {
            return Err(HostError::AlreadyRunning);
        }

        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HostError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!("Starting HTTP server on {}", local_addr);

        let app = router(self.session_manager.clone());
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                    info!("HTTP server shutdown signal received");
                })
                .await
        });

        let sweeper_handle =
            IdleSweeper::new(self.session_manager.clone(), self.config.sweep_interval).spawn();

        self.server_handle = Some(server_handle);
        self.sweeper_handle = Some(sweeper_handle);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        info!("HTTP server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// Stop accepting requests, stop the sweeper, and tear down every
    /// live session.
    pub async fn shutdown(mut self) -> Result<(), HostError> {
        info!("Initiating ServiceHost shutdown");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(sweeper_handle) = self.sweeper_handle.take() {
            sweeper_handle.abort();
        }

        let mut result = Ok(());
        if let Some(server_handle) = self.server_handle.take() {
            match server_handle.await {
                Ok(Ok(())) => info!("HTTP server shut down successfully"),
                Ok(Err(e)) => {
                    error!("HTTP server error during shutdown: {}", e);
                    result = Err(HostError::Serve(e));
                }
                Err(e) => {
                    error!("Failed to join server task: {}", e);
                    result = Err(HostError::Join(e));
                }
            }
        }

        self.session_manager.shutdown_all().await;

        info!("ServiceHost shutdown complete");
        result
    }

    /// Wait for the server task to finish.
    pub async fn wait(&mut self) -> Result<(), HostError> {
        let handle = self.server_handle.take().ok_or(HostError::NotRunning)?;
        handle.await??;
        Ok(())
    }
}
