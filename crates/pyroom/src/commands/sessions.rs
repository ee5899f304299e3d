use async_trait::async_trait;
use chrono::Local;
use eyre::Result;
use std::io::Write;

use super::Command;
use crate::client::PyroomClient;

pub struct SessionsCommand {
    pub server: String,
}

#[async_trait]
impl Command for SessionsCommand {
    async fn execute(&self) -> Result<()> {
        let sessions = PyroomClient::new(&self.server).sessions().await?;

        let mut stdout = std::io::stdout();
        if sessions.is_empty() {
            writeln!(stdout, "No sessions found.")?;
            return Ok(());
        }

        writeln!(stdout, "{:<40} {:<20} {:>10}", "ID", "Created", "Idle (s)")?;
        writeln!(stdout, "{}", "-".repeat(72))?;
        for session in sessions {
            writeln!(
                stdout,
                "{:<40} {:<20} {:>10}",
                session.conversation_id,
                session
                    .created_at
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
                session.idle_secs,
            )?;
        }
        Ok(())
    }
}
