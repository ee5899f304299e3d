//! Service configuration loaded from TOML.
//!
//! Every field is optional; a missing file means all defaults. A file that
//! exists but does not parse is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deps::InstallerCommand;
use crate::engine::InterpreterCommand;
use crate::error::{Error, Result};
use crate::utils::AppPaths;

pub const DEFAULT_BOOTSTRAP_CODE: &str = "\
import pandas as pd
import numpy as np
import matplotlib.pyplot as plt
import os
import matplotlib
matplotlib.use('Agg')
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Parent of all per-session workspaces. `None` means the platform
    /// data directory.
    pub sessions_root: Option<PathBuf>,
    /// Run once after every (re)start to establish the working environment.
    pub bootstrap_code: String,
    pub interpreter: InterpreterCommand,
    pub timeouts: TimeoutConfig,
    pub gc: GcConfig,
    pub installer: InstallerCommand,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sessions_root: None,
            bootstrap_code: DEFAULT_BOOTSTRAP_CODE.to_string(),
            interpreter: InterpreterCommand::default(),
            timeouts: TimeoutConfig::default(),
            gc: GcConfig::default(),
            installer: InstallerCommand::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub readiness_secs: u64,
    /// Bound for re-checking an alive but not-ready kernel before restarting it.
    pub readiness_retry_secs: u64,
    pub readiness_poll_ms: u64,
    /// Longest gap between two messages of one execution.
    pub message_secs: u64,
    /// Quiet period that ends a drain of stale messages.
    pub drain_ms: u64,
    pub install_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            readiness_secs: 30,
            readiness_retry_secs: 5,
            readiness_poll_ms: 100,
            message_secs: 20,
            drain_ms: 100,
            install_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn readiness(&self) -> Duration {
        Duration::from_secs(self.readiness_secs)
    }

    pub fn readiness_retry(&self) -> Duration {
        Duration::from_secs(self.readiness_retry_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn message(&self) -> Duration {
        Duration::from_secs(self.message_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub sweep_interval_secs: u64,
    pub idle_threshold_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            idle_threshold_secs: 3600,
        }
    }
}

impl GcConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

impl ServiceConfig {
    /// Load from `path`, or from the user config file when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match AppPaths::user_config_file() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.sessions_root
            .clone()
            .unwrap_or_else(AppPaths::default_sessions_root)
    }

    pub fn with_sessions_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sessions_root = Some(root.into());
        self
    }

    pub fn with_bootstrap_code(mut self, code: impl Into<String>) -> Self {
        self.bootstrap_code = code.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }
}
