use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::path::PathBuf;

use super::Command;
use pyroom_core::ServiceConfig;
use pyroom_core::utils::AppPaths;

pub enum ConfigAction {
    Show,
    Path,
}

pub struct ConfigCommand {
    pub action: ConfigAction,
    pub config_path: Option<PathBuf>,
}

impl ConfigCommand {
    fn resolved_path(&self) -> Option<PathBuf> {
        self.config_path.clone().or_else(AppPaths::user_config_file)
    }
}

#[async_trait]
impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        let mut stdout = std::io::stdout();
        match self.action {
            ConfigAction::Show => {
                let config = ServiceConfig::load(self.config_path.as_deref())
                    .map_err(|e| eyre!("Failed to load config: {}", e))?;
                if let Some(path) = self.resolved_path() {
                    let state = if path.exists() { "" } else { " (not found, using defaults)" };
                    writeln!(stdout, "Config file: {}{state}", path.display())?;
                }
                writeln!(stdout, "Sessions root: {}", config.sessions_root().display())?;
                writeln!(stdout, "\n{}", config.to_toml()?)?;
            }
            ConfigAction::Path => match self.resolved_path() {
                Some(path) => writeln!(stdout, "{}", path.display())?,
                None => return Err(eyre!("Could not determine the user config directory")),
            },
        }
        Ok(())
    }
}
