//! Configuration
//!
//! Replica settings and the peer table. Loaded in layers: built-in defaults,
//! then the TOML file, then `VDFS__*` environment overrides.

pub mod facade;
pub mod merge;
pub mod paths;
pub mod sources;

pub use facade::ConfigLoader;

use crate::error::FsError;
use crate::logging::LoggingConfig;
use crate::types::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Identity value that matches the peer entry named after this host
pub const AUTO_IDENTITY: &str = "auto";

/// Cross-replica write coordination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// Last writer wins by timestamp
    #[default]
    #[serde(rename = "none", alias = "eventual")]
    Eventual,
    /// Single-writer token
    Strong,
}

/// One row of the peer table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub pid: ReplicaId,
    /// Where the filesystem adapter mounts this replica
    #[serde(default)]
    pub mount: PathBuf,
    /// Block store location
    pub store: PathBuf,
    pub addr: String,
    pub port: u16,
    #[serde(default)]
    pub nat_addr: Option<String>,
    #[serde(default)]
    pub nat_port: Option<u16>,
}

impl PeerConfig {
    /// Address to dial from a host whose IP is `host_ip`
    ///
    /// The NAT pair is used when its address shares the first two octets
    /// with the host, i.e. both sides sit on the same private network.
    pub fn dial_address(&self, host_ip: Option<&str>) -> String {
        if let (Some(nat_addr), Some(nat_port), Some(host)) =
            (&self.nat_addr, self.nat_port, host_ip)
        {
            if same_network(nat_addr, host) {
                return format!("{}:{}", nat_addr, nat_port);
            }
        }
        format!("{}:{}", self.addr, self.port)
    }
}

fn same_network(a: &str, b: &str) -> bool {
    let prefix = |s: &str| -> Option<(String, String)> {
        let mut parts = s.split('.');
        Some((parts.next()?.to_string(), parts.next()?.to_string()))
    };
    match (prefix(a), prefix(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Everything a replica process needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Peer name of this replica, or `auto`
    #[serde(default = "default_identity")]
    pub replica: String,

    /// Peer that hands out the session key; `None` means this replica does
    #[serde(default)]
    pub auth_peer: Option<String>,

    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    #[serde(default = "default_flush_period")]
    pub flush_period_secs: u64,

    #[serde(default)]
    pub consistency: ConsistencyMode,

    /// Whether this replica starts out holding the write token
    #[serde(default)]
    pub token: bool,

    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,

    #[serde(default = "default_dial_backoff")]
    pub dial_backoff_ms: u64,

    /// Per-call deadline; 0 disables it
    #[serde(default)]
    pub call_timeout_ms: u64,

    #[serde(default = "default_token_attempts")]
    pub token_attempts: u32,

    #[serde(default = "default_token_retry")]
    pub token_retry_ms: u64,

    /// Discard the local store on startup
    #[serde(default)]
    pub new_fs: bool,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_identity() -> String {
    AUTO_IDENTITY.to_string()
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_flush_period() -> u64 {
    5
}

fn default_dial_attempts() -> u32 {
    50
}

fn default_dial_backoff() -> u64 {
    20
}

fn default_token_attempts() -> u32 {
    20
}

fn default_token_retry() -> u64 {
    250
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            replica: default_identity(),
            auth_peer: None,
            key_dir: default_key_dir(),
            flush_period_secs: default_flush_period(),
            consistency: ConsistencyMode::default(),
            token: false,
            dial_attempts: default_dial_attempts(),
            dial_backoff_ms: default_dial_backoff(),
            call_timeout_ms: 0,
            token_attempts: default_token_attempts(),
            token_retry_ms: default_token_retry(),
            new_fs: false,
            peers: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ReplicaConfig {
    pub fn validate(&self) -> Result<(), FsError> {
        if self.flush_period_secs == 0 {
            return Err(FsError::Config("flush_period_secs must be positive".to_string()));
        }
        if self.dial_attempts == 0 || self.token_attempts == 0 {
            return Err(FsError::Config("retry budgets must be positive".to_string()));
        }
        let mut names = HashSet::new();
        let mut pids = HashSet::new();
        for peer in &self.peers {
            if !names.insert(peer.name.as_str()) {
                return Err(FsError::Config(format!("duplicate peer name '{}'", peer.name)));
            }
            if !pids.insert(peer.pid) {
                return Err(FsError::Config(format!("duplicate peer pid {}", peer.pid)));
            }
            if peer.nat_addr.is_some() != peer.nat_port.is_some() {
                return Err(FsError::Config(format!(
                    "peer '{}': nat_addr and nat_port go together",
                    peer.name
                )));
            }
        }
        if let Some(auth) = &self.auth_peer {
            if !names.contains(auth.as_str()) {
                return Err(FsError::Config(format!("auth peer '{}' is not in the peer table", auth)));
            }
        }
        Ok(())
    }

    /// The peer entry describing this replica
    pub fn identity(&self, host_name: Option<&str>) -> Result<&PeerConfig, FsError> {
        let wanted = if self.replica == AUTO_IDENTITY {
            let host = host_name
                .ok_or_else(|| FsError::Config("cannot determine host name".to_string()))?;
            host.strip_suffix(".local").unwrap_or(host).to_string()
        } else {
            self.replica.clone()
        };
        self.peers
            .iter()
            .find(|p| p.name == wanted)
            .ok_or_else(|| FsError::Config(format!("no peer entry named '{}'", wanted)))
    }

    /// Whether `name` mints the session key instead of asking for it
    pub fn is_auth_peer(&self, name: &str) -> bool {
        match &self.auth_peer {
            None => true,
            Some(auth) => auth == name,
        }
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_secs)
    }

    pub fn dial_backoff(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }

    pub fn token_retry(&self) -> Duration {
        Duration::from_millis(self.token_retry_ms)
    }
}

/// This host's name, as used by `replica = "auto"`
pub fn host_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// This host's outward-facing IPv4 address, if one can be determined
pub fn host_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, pid: ReplicaId) -> PeerConfig {
        PeerConfig {
            name: name.to_string(),
            pid,
            mount: PathBuf::from(format!("/tmp/{}", name)),
            store: PathBuf::from(format!("/tmp/{}.db", name)),
            addr: "203.0.113.5".to_string(),
            port: 8000 + pid as u16,
            nat_addr: None,
            nat_port: None,
        }
    }

    #[test]
    fn test_identity_by_name_and_auto() {
        let mut config = ReplicaConfig {
            peers: vec![peer("hub", 1), peer("laptop", 2)],
            ..ReplicaConfig::default()
        };
        assert_eq!(config.identity(Some("laptop.local")).unwrap().pid, 2);
        assert!(config.identity(Some("elsewhere")).is_err());
        assert!(config.identity(None).is_err());

        config.replica = "hub".to_string();
        assert_eq!(config.identity(None).unwrap().pid, 1);
    }

    #[test]
    fn test_auto_identity_uses_system_host_name() {
        let name = host_name().expect("host name");
        let short = name.strip_suffix(".local").unwrap_or(&name).to_string();
        let config = ReplicaConfig {
            peers: vec![peer("vdfs-other-host", 1), peer(&short, 2)],
            ..ReplicaConfig::default()
        };
        assert_eq!(config.identity(host_name().as_deref()).unwrap().pid, 2);
    }

    #[test]
    fn test_nat_pair_used_on_same_network() {
        let mut p = peer("hub", 1);
        p.nat_addr = Some("192.168.1.13".to_string());
        p.nat_port = Some(9000);
        assert_eq!(p.dial_address(Some("192.168.7.40")), "192.168.1.13:9000");
        assert_eq!(p.dial_address(Some("10.0.0.2")), "203.0.113.5:8001");
        assert_eq!(p.dial_address(None), "203.0.113.5:8001");
    }

    #[test]
    fn test_validation() {
        let mut config = ReplicaConfig {
            peers: vec![peer("hub", 1), peer("edge", 2)],
            auth_peer: Some("hub".to_string()),
            ..ReplicaConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.is_auth_peer("hub"));
        assert!(!config.is_auth_peer("edge"));

        config.peers[1].pid = 1;
        assert!(config.validate().is_err());
        config.peers[1].pid = 2;

        config.peers[1].nat_addr = Some("10.0.0.1".to_string());
        assert!(config.validate().is_err());
        config.peers[1].nat_addr = None;

        config.auth_peer = Some("ghost".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_call_timeout_zero_is_off() {
        let mut config = ReplicaConfig::default();
        assert_eq!(config.call_timeout(), None);
        config.call_timeout_ms = 1500;
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(1500)));
    }
}
