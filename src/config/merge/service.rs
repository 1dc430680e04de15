//! MergeService: orchestrates sources and deserializes to ReplicaConfig.

use crate::config::sources::{environment, file};
use crate::config::ReplicaConfig;
use config::ConfigError;
use std::path::Path;

use super::builder_with_defaults;

/// Merge service for config composition.
pub struct MergeService;

impl MergeService {
    /// Precedence: defaults (lowest) -> config file -> environment (highest).
    pub fn load_from_file(path: &Path) -> Result<ReplicaConfig, ConfigError> {
        let builder = builder_with_defaults()?;
        let builder = file::add_to_builder(builder, path)?;
        let builder = environment::add_to_builder(builder)?;
        builder.build()?.try_deserialize()
    }

    /// Defaults plus environment, for hosts with no config file.
    pub fn load_without_file() -> Result<ReplicaConfig, ConfigError> {
        let builder = environment::add_to_builder(builder_with_defaults()?)?;
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsistencyMode;
    use std::io::Write;

    #[test]
    fn test_file_layer_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdfs.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
replica = "hub"
consistency = "strong"
token = true

[[peers]]
name = "hub"
pid = 1
store = "/var/lib/vdfs/hub"
addr = "10.0.0.1"
port = 7001

[[peers]]
name = "edge"
pid = 2
store = "/var/lib/vdfs/edge"
addr = "10.0.0.2"
port = 7002
nat_addr = "192.168.1.2"
nat_port = 7102
"#
        )
        .unwrap();

        let config = MergeService::load_from_file(&path).unwrap();
        assert_eq!(config.replica, "hub");
        assert_eq!(config.consistency, ConsistencyMode::Strong);
        assert!(config.token);
        assert_eq!(config.flush_period_secs, 5);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].nat_port, Some(7102));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MergeService::load_from_file(&dir.path().join("absent.toml")).is_err());
    }
}
