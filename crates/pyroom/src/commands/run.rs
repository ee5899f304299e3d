use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

use super::Command;
use crate::client::PyroomClient;

pub struct RunCommand {
    pub conversation_id: String,
    pub code: Option<String>,
    pub file: Option<PathBuf>,
    pub dependencies: Vec<String>,
    pub server: String,
}

impl RunCommand {
    async fn read_code(&self) -> Result<String> {
        if let Some(code) = &self.code {
            return Ok(code.clone());
        }
        if let Some(path) = &self.file {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e));
        }
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        Ok(code)
    }
}

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self) -> Result<()> {
        let code = self.read_code().await?;
        let client = PyroomClient::new(&self.server);

        match client
            .run(&self.conversation_id, &code, &self.dependencies)
            .await
        {
            Ok(output) => {
                if !output.is_empty() {
                    writeln!(std::io::stdout(), "{output}")?;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(traceback) = e.traceback() {
                    let mut stderr = std::io::stderr();
                    for line in traceback {
                        writeln!(stderr, "{line}")?;
                    }
                }
                Err(eyre!(e))
            }
        }
    }
}
