use async_trait::async_trait;
use eyre::Result;
use std::io::Write;

use super::Command;
use crate::client::PyroomClient;

pub struct EndCommand {
    pub conversation_id: String,
    pub server: String,
}

#[async_trait]
impl Command for EndCommand {
    async fn execute(&self) -> Result<()> {
        let message = PyroomClient::new(&self.server)
            .end_session(&self.conversation_id)
            .await?;
        writeln!(std::io::stdout(), "{message}")?;
        Ok(())
    }
}
