use async_trait::async_trait;
use eyre::Result;

pub mod config;
pub mod end;
pub mod reset;
pub mod run;
pub mod serve;
pub mod sessions;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}
