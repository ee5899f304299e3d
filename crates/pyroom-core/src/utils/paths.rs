use std::path::PathBuf;

/// Standardized application directories for pyroom.
pub struct AppPaths;

impl AppPaths {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("", "", "pyroom")
    }

    /// User-level config directory (platform-specific)
    pub fn user_config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|d| d.config_dir().to_path_buf())
    }

    /// User-level data directory (platform-specific)
    pub fn user_data_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|d| d.data_dir().to_path_buf())
    }

    /// Default config file: `<config dir>/config.toml`
    pub fn user_config_file() -> Option<PathBuf> {
        Self::user_config_dir().map(|d| d.join("config.toml"))
    }

    /// Root under which every session gets its own workspace directory.
    /// Falls back to the system temp dir when no home directory is known.
    pub fn default_sessions_root() -> PathBuf {
        Self::user_data_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("pyroom"))
            .join("sessions")
    }

    /// Default directory for rolling log files.
    pub fn default_log_dir() -> Option<PathBuf> {
        Self::user_data_dir().map(|d| d.join("logs"))
    }
}
