use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::Command;
use pyroom_core::{ServiceConfig, SessionManager};
use pyroom_server::{ServiceHost, ServiceHostConfig};

pub struct ServeCommand {
    pub port: u16,
    pub bind: String,
    pub sessions_root: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

impl ServeCommand {
    fn load_config(&self) -> Result<ServiceConfig> {
        let mut config = ServiceConfig::load(self.config_path.as_deref())
            .map_err(|e| eyre!("Failed to load config: {}", e))?;
        if let Some(root) = &self.sessions_root {
            config = config.with_sessions_root(root.clone());
        }
        Ok(config)
    }
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| eyre!("Invalid bind address: {}", e))?;

        let config = self.load_config()?;
        let sessions_root = config.sessions_root();
        std::fs::create_dir_all(&sessions_root).map_err(|e| {
            eyre!(
                "Failed to create sessions root {}: {}",
                sessions_root.display(),
                e
            )
        })?;
        info!(sessions_root = %sessions_root.display(), "Using sessions root");

        let manager = Arc::new(SessionManager::from_service_config(&config));
        let mut host = ServiceHost::new(
            ServiceHostConfig::from_service_config(&config, addr),
            manager,
        );
        let local_addr = host
            .start()
            .await
            .map_err(|e| eyre!("Failed to start server: {}", e))?;

        let mut stdout = std::io::stdout();
        writeln!(stdout, "Server listening on {local_addr}")?;
        writeln!(stdout, "Press Ctrl+C to shutdown")?;

        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");

        host.shutdown()
            .await
            .map_err(|e| eyre!("Failed to shutdown server: {}", e))?;
        info!("Server shutdown complete");

        Ok(())
    }
}
