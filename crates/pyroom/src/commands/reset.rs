use async_trait::async_trait;
use eyre::Result;
use std::io::Write;

use super::Command;
use crate::client::PyroomClient;

pub struct ResetCommand {
    pub conversation_id: String,
    pub server: String,
}

#[async_trait]
impl Command for ResetCommand {
    async fn execute(&self) -> Result<()> {
        let message = PyroomClient::new(&self.server)
            .reset(&self.conversation_id)
            .await?;
        writeln!(std::io::stdout(), "{message}")?;
        Ok(())
    }
}
