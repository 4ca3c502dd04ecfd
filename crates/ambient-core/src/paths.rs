//! Centralized path utilities
//!
//! All control-plane paths in one place for consistency

use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = ".ambient";

/// Get the ambient config directory (~/.ambient)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Default config file (~/.ambient/control-plane.toml)
pub fn default_config_file() -> PathBuf {
    config_dir().join("control-plane.toml")
}

/// Root for local-mode session workspaces (~/.ambient/sessions)
pub fn sessions_dir() -> PathBuf {
    config_dir().join("sessions")
}

/// Working directory handed to a session's runner (`<root>/<id>/workspace`)
pub fn session_workspace(root: &Path, session_id: &str) -> PathBuf {
    root.join(session_id).join("workspace")
}

/// Log directory for a session's runner (`<root>/<id>/logs`)
pub fn session_logs(root: &Path, session_id: &str) -> PathBuf {
    root.join(session_id).join("logs")
}
