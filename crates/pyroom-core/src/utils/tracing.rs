use std::io;
use std::path::Path;

use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

const LOG_FILE_PREFIX: &str = "pyroom.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing. Filter comes from RUST_LOG (default `info`).
///
/// With a log directory, events go to a daily-rolling file there;
/// otherwise to stdout.
pub fn init_tracing(log_dir: Option<&Path>) -> io::Result<()> {
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)?;
        let file_appender = rolling::daily(dir, LOG_FILE_PREFIX);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(env_filter());

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

        tracing::debug!(
            target: "pyroom::utils::tracing",
            path = %dir.display(),
            "Tracing initialized with file output. Filter configured via RUST_LOG env var."
        );
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(fmt::Layer::default().with_ansi(true).with_target(true))
            .with(env_filter());

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

        tracing::debug!(
            target: "pyroom::utils::tracing",
            "Tracing initialized with stdout output. Filter configured via RUST_LOG env var."
        );
    }

    Ok(())
}
