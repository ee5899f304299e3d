use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5002";

/// Persistent Python interpreter sessions, one per conversation.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Path to the service config file (defaults to the user config dir)
    #[arg(long, env = "PYROOM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Start the HTTP service
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = pyroom_server::DEFAULT_PORT)]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Directory holding per-session workspaces (overrides the config file)
        #[arg(long, env = "PYROOM_SESSIONS_ROOT")]
        sessions_root: Option<PathBuf>,

        /// Write logs to a daily-rolling file in this directory instead of stdout
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Write logs to the default log directory
        #[arg(long, conflicts_with = "log_dir")]
        log_to_file: bool,
    },
    /// Run code in a session of a running service
    Run {
        /// Conversation id of the session
        conversation_id: String,

        /// Code to run. Reads --file or stdin when omitted.
        #[arg(long, short, conflicts_with = "file")]
        code: Option<String>,

        /// File containing the code to run
        #[arg(long, short)]
        file: Option<PathBuf>,

        /// Package to install and import before running (repeatable)
        #[arg(long = "dep", value_name = "PACKAGE")]
        dependencies: Vec<String>,

        /// Service URL
        #[arg(long, env = "PYROOM_URL", default_value = DEFAULT_SERVER_URL)]
        server: String,
    },
    /// Restart the kernel of a session, clearing its state
    Reset {
        conversation_id: String,

        /// Service URL
        #[arg(long, env = "PYROOM_URL", default_value = DEFAULT_SERVER_URL)]
        server: String,
    },
    /// End a session and remove its workspace
    End {
        conversation_id: String,

        /// Service URL
        #[arg(long, env = "PYROOM_URL", default_value = DEFAULT_SERVER_URL)]
        server: String,
    },
    /// List live sessions
    Sessions {
        /// Service URL
        #[arg(long, env = "PYROOM_URL", default_value = DEFAULT_SERVER_URL)]
        server: String,
    },
    /// Inspect the service configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print the path of the config file in use
    Path,
}
