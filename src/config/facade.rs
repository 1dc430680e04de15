//! ConfigLoader facade delegating to merge service.

use super::merge::service::MergeService;
use super::paths::xdg_root;
use super::ReplicaConfig;
use crate::error::FsError;
use std::path::Path;

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from an explicit file, or the XDG default when `path` is `None`.
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<ReplicaConfig, FsError> {
        let config = match path {
            Some(path) => MergeService::load_from_file(path)?,
            None => {
                let default_path = xdg_root::default_config_path()?;
                if default_path.exists() {
                    MergeService::load_from_file(&default_path)?
                } else {
                    MergeService::load_without_file()?
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Create default configuration.
    pub fn default() -> ReplicaConfig {
        ReplicaConfig::default()
    }
}
