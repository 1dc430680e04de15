//! XDG Base Directory utilities.

use crate::error::FsError;
use std::path::PathBuf;

/// Get XDG config home directory
///
/// Returns `$XDG_CONFIG_HOME` if set, otherwise defaults to `$HOME/.config`
pub fn config_home() -> Result<PathBuf, FsError> {
    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg_config_home.is_empty() {
            return Ok(PathBuf::from(xdg_config_home));
        }
    }

    let home = std::env::var("HOME").map_err(|_| {
        FsError::Config("Could not determine XDG config home directory (HOME not set)".to_string())
    })?;

    Ok(PathBuf::from(home).join(".config"))
}

/// `$XDG_CONFIG_HOME/vdfs/config.toml`
pub fn default_config_path() -> Result<PathBuf, FsError> {
    Ok(config_home()?.join("vdfs").join("config.toml"))
}

/// `$XDG_CONFIG_HOME/vdfs/keys`, where `keygen` writes when no directory is given
pub fn default_key_dir() -> Result<PathBuf, FsError> {
    Ok(config_home()?.join("vdfs").join("keys"))
}
