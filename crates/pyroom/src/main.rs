use clap::Parser;
use eyre::Result;

use pyroom::cli::{Cli, Commands, ConfigCommands};
use pyroom::commands::{
    Command,
    config::{ConfigAction, ConfigCommand},
    end::EndCommand,
    reset::ResetCommand,
    run::RunCommand,
    serve::ServeCommand,
    sessions::SessionsCommand,
};
use pyroom_core::utils::AppPaths;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Only the service logs to a file; client commands log to stdout.
    let log_dir = match &cli.command {
        Commands::Serve {
            log_dir: Some(dir), ..
        } => Some(dir.clone()),
        Commands::Serve {
            log_to_file: true, ..
        } => Some(
            AppPaths::default_log_dir()
                .ok_or_else(|| eyre::eyre!("Could not determine the default log directory"))?,
        ),
        _ => None,
    };
    pyroom_core::utils::tracing::init_tracing(log_dir.as_deref())?;

    let command: Box<dyn Command> = match cli.command {
        Commands::Serve {
            port,
            bind,
            sessions_root,
            ..
        } => Box::new(ServeCommand {
            port,
            bind,
            sessions_root,
            config_path: cli.config,
        }),
        Commands::Run {
            conversation_id,
            code,
            file,
            dependencies,
            server,
        } => Box::new(RunCommand {
            conversation_id,
            code,
            file,
            dependencies,
            server,
        }),
        Commands::Reset {
            conversation_id,
            server,
        } => Box::new(ResetCommand {
            conversation_id,
            server,
        }),
        Commands::End {
            conversation_id,
            server,
        } => Box::new(EndCommand {
            conversation_id,
            server,
        }),
        Commands::Sessions { server } => Box::new(SessionsCommand { server }),
        Commands::Config { action } => Box::new(ConfigCommand {
            action: match action {
                ConfigCommands::Show => ConfigAction::Show,
                ConfigCommands::Path => ConfigAction::Path,
            },
            config_path: cli.config,
        }),
    };

    command.execute().await
}
