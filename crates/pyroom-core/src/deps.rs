//! Per-request dependency installation.
//!
//! Each package is installed by an external installer and then imported
//! inside the session's interpreter. The list is processed in order and
//! stops at the first failure.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::correlator::ExecutionCorrelator;
use crate::engine::EngineAdapter;
use crate::error::{Error, ExecutionFailure, InstallFailureKind, Result};

/// Installer output kept in failure messages is capped to this many chars.
const MAX_INSTALLER_OUTPUT: usize = 2000;

static IMPORT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .unwrap_or_else(|_| unreachable!("import name pattern is valid"))
});

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to launch installer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("installer failed ({status}): {output}")]
    Failed { status: String, output: String },

    #[error("installer timed out after {}s", .timeout.as_secs())]
    TimedOut { timeout: Duration },
}

impl InstallError {
    pub fn kind(&self) -> InstallFailureKind {
        match self {
            InstallError::Spawn(_) => InstallFailureKind::Spawn,
            InstallError::Failed { .. } => InstallFailureKind::ExitStatus,
            InstallError::TimedOut { .. } => InstallFailureKind::TimedOut,
        }
    }
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, package: &str) -> std::result::Result<(), InstallError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for InstallerCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), "pip".to_string(), "install".to_string()],
        }
    }
}

/// Runs `<program> <args...> <package>` with a time bound.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    command: InstallerCommand,
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(command: InstallerCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    async fn run(&self, package: &str) -> std::result::Result<(), InstallError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg(package)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .spawn()
            .map_err(InstallError::Spawn)?
            .wait_with_output()
            .await
            .map_err(InstallError::Spawn)?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        Err(InstallError::Failed {
            status: output.status.to_string(),
            output: tail(detail, MAX_INSTALLER_OUTPUT).to_string(),
        })
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn install(&self, package: &str) -> std::result::Result<(), InstallError> {
        match timeout(self.timeout, self.run(package)).await {
            Ok(result) => result,
            Err(_) => Err(InstallError::TimedOut {
                timeout: self.timeout,
            }),
        }
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    text.char_indices()
        .nth(skip)
        .map_or(text, |(idx, _)| &text[idx..])
}

/// Best-effort module name for a package requirement: drops extras,
/// version constraints, markers and URLs, then maps `-` to `_`.
///
/// Returns `None` when nothing importable is left.
pub fn derive_import_name(package: &str) -> Option<String> {
    let base = package
        .split(|c: char| {
            matches!(c, '[' | '=' | '<' | '>' | '~' | '!' | ';' | '@' | ',') || c.is_whitespace()
        })
        .next()
        .unwrap_or_default()
        .trim();
    let name = base.replace('-', "_");
    IMPORT_NAME.is_match(&name).then_some(name)
}

/// Install and import each package in order, stopping at the first failure.
pub async fn install_dependencies(
    installer: &dyn PackageInstaller,
    correlator: &ExecutionCorrelator,
    adapter: &mut EngineAdapter,
    packages: &[String],
) -> Result<()> {
    for package in packages {
        let package = package.trim();
        if package.is_empty() {
            continue;
        }
        if package.starts_with('-') {
            return Err(Error::DependencyInstallFailure {
                package: package.to_string(),
                kind: InstallFailureKind::Rejected,
                message: "package names must not start with '-'".to_string(),
            });
        }

        info!(conversation_id = %adapter.label(), package = %package, "Installing dependency");
        if let Err(e) = installer.install(package).await {
            warn!(conversation_id = %adapter.label(), package = %package, error = %e, "Dependency install failed");
            return Err(Error::DependencyInstallFailure {
                package: package.to_string(),
                kind: e.kind(),
                message: e.to_string(),
            });
        }

        let Some(import_name) = derive_import_name(package) else {
            return Err(Error::DependencyImportFailure {
                package: package.to_string(),
                import_name: String::new(),
                source: Box::new(Error::ExecutionError(ExecutionFailure {
                    ename: "ValueError".to_string(),
                    evalue: format!("cannot derive a module name from '{package}'"),
                    traceback: Vec::new(),
                })),
            });
        };

        debug!(conversation_id = %adapter.label(), package = %package, import_name = %import_name, "Importing dependency");
        if let Err(e) = correlator
            .execute(adapter, &format!("import {import_name}"))
            .await
        {
            warn!(conversation_id = %adapter.label(), package = %package, error = %e, "Dependency import failed");
            return Err(Error::DependencyImportFailure {
                package: package.to_string(),
                import_name,
                source: Box::new(e),
            });
        }
    }
    Ok(())
}
