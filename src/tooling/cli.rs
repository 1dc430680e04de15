//! CLI Tooling
//!
//! `serve` runs a replica until interrupted. The inspection commands open
//! the replica's store directly and never touch the network, so they need
//! the replica to be stopped (the store is locked while it runs).

use crate::channel::KeyRing;
use crate::config::{self, paths::xdg_root, ConfigLoader, ReplicaConfig};
use crate::error::FsError;
use crate::net::Server;
use crate::replica::Replica;
use crate::replication::Flusher;
use crate::store::{BlockStore, SledBlockStore};
use crate::tree::{NodeGraph, NodeKind, Offline};
use crate::types::short_hex;
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::info;

/// vdfs - versioned, replicated file store
#[derive(Parser)]
#[command(name = "vdfs")]
#[command(about = "Versioned, content-addressed, replicated file store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Peer name to run as (overrides `replica` from the config)
    #[arg(long)]
    pub replica: Option<String>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the replica: peer server, authentication, periodic flush
    Serve {
        /// Start from an empty store
        #[arg(long)]
        new_fs: bool,
    },
    /// Show the persisted head
    Head {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Walk the root's version chain, newest first
    History {
        /// Maximum number of versions to show
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List a directory; `name@-1h` and `name@versions` open historical views
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file's contents
    Cat { path: String },
    /// Generate an RSA key pair for a peer
    Keygen {
        name: String,
        #[arg(long, default_value = "2048")]
        bits: usize,
        /// Key directory (defaults to `key_dir` from the config)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// Resolved configuration plus command execution
pub struct CliContext {
    config: ReplicaConfig,
}

impl CliContext {
    pub fn new(config_path: Option<PathBuf>, replica: Option<String>) -> Result<Self, FsError> {
        let mut config = ConfigLoader::load(config_path.as_deref())?;
        if let Some(name) = replica {
            config.replica = name;
        }
        Ok(CliContext { config })
    }

    pub fn from_config(config: ReplicaConfig) -> Self {
        CliContext { config }
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Apply `--log-*` flags on top of the configured logging table
    pub fn apply_log_overrides(&mut self, cli: &Cli) {
        let logging = &mut self.config.logging;
        if let Some(level) = &cli.log_level {
            logging.level = level.clone();
        }
        if let Some(format) = &cli.log_format {
            logging.format = format.clone();
        }
        if let Some(output) = &cli.log_output {
            logging.output = output.clone();
        }
        if let Some(file) = &cli.log_file {
            logging.file = Some(file.clone());
        }
    }

    pub async fn execute(&self, command: &Commands) -> Result<String, FsError> {
        match command {
            Commands::Serve { new_fs } => self.serve(*new_fs).await,
            Commands::Head { format } => self.head(format),
            Commands::History { limit, format } => self.history(*limit, format).await,
            Commands::Ls { path } => self.ls(path).await,
            Commands::Cat { path } => self.cat(path).await,
            Commands::Keygen { name, bits, dir } => {
                let dir = match dir {
                    Some(dir) => dir.clone(),
                    None if self.config.key_dir.is_absolute() => self.config.key_dir.clone(),
                    None => xdg_root::default_key_dir()?,
                };
                let keys = KeyRing::new(dir);
                keys.generate(name, *bits)?;
                Ok(format!(
                    "Wrote {} and {}",
                    keys.private_path(name).display(),
                    keys.public_path(name).display()
                ))
            }
        }
    }

    async fn serve(&self, new_fs: bool) -> Result<String, FsError> {
        let mut config = self.config.clone();
        config.new_fs |= new_fs;
        let replica = Replica::open(&config)?;
        let host = config::host_name();
        let identity = config.identity(host.as_deref())?;

        let server = Server::bind(("0.0.0.0", identity.port)).await?;
        let (stop, stopped) = watch::channel(false);
        let listener = tokio::spawn(server.serve(Arc::clone(&replica), stopped));

        replica.authenticate().await?;
        let flusher = Flusher::start(Arc::clone(&replica), config.flush_period());
        info!(replica = replica.id(), name = replica.name(), "Replica running");

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| FsError::Config(format!("cannot wait for Ctrl-C: {}", e)))?;
        info!("Shutting down");
        flusher.stop().await;
        let last = replica.flush_cycle().await?;
        let _ = stop.send(true);
        let _ = listener.await;

        Ok(match last.committed {
            Some(head) => format!("Stopped {} at root {}", replica.name(), hex::encode(head.root_hash)),
            None => format!("Stopped {}", replica.name()),
        })
    }

    fn open_store(&self) -> Result<Arc<dyn BlockStore>, FsError> {
        let host = config::host_name();
        let identity = self.config.identity(host.as_deref())?;
        let store = SledBlockStore::open(&identity.store, false)?;
        Ok(Arc::new(store))
    }

    fn open_graph(&self) -> Result<NodeGraph, FsError> {
        let host = config::host_name();
        let identity = self.config.identity(host.as_deref())?;
        NodeGraph::open(self.open_store()?, identity.pid)
    }

    fn head(&self, format: &str) -> Result<String, FsError> {
        let head = self
            .open_store()?
            .load_head()?
            .ok_or_else(|| FsError::NotFound("no head recorded yet".to_string()))?;
        if format == "json" {
            let value = json!({
                "root_hash": hex::encode(head.root_hash),
                "next_inode": head.next_inode,
                "replica_id": head.replica_id,
            });
            return serde_json::to_string_pretty(&value)
                .map_err(|e| FsError::SerializationFailure(e.to_string()));
        }
        Ok(format!(
            "root:       {}\nnext inode: {}\nreplica:    {}",
            hex::encode(head.root_hash),
            head.next_inode,
            head.replica_id
        ))
    }

    async fn history(&self, limit: usize, format: &str) -> Result<String, FsError> {
        let graph = self.open_graph()?;
        let versions = graph.versions(graph.root(), &Offline).await?;
        let rows = versions.iter().take(limit);

        if format == "json" {
            let arr: Vec<_> = rows
                .map(|(hash, record)| {
                    json!({
                        "hash": hex::encode(hash),
                        "version": record.version,
                        "mtime": format_time(record.attrs.mtime),
                        "owner": record.owner,
                        "entries": record.child_hashes.len(),
                    })
                })
                .collect();
            return serde_json::to_string_pretty(&arr)
                .map_err(|e| FsError::SerializationFailure(e.to_string()));
        }

        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Version", "Hash", "Modified", "Owner", "Entries"]);
        for (hash, record) in rows {
            table.add_row(vec![
                record.version.to_string(),
                short_hex(hash),
                format_time(record.attrs.mtime),
                record.owner.to_string(),
                record.child_hashes.len().to_string(),
            ]);
        }
        Ok(table.to_string())
    }

    async fn ls(&self, path: &str) -> Result<String, FsError> {
        let mut graph = self.open_graph()?;
        let dir = graph.resolve(path, &Offline).await?;
        let entries = graph.read_dir(dir, &Offline).await?;

        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Name", "Kind", "Inode", "Size", "Modified"]);
        for entry in entries {
            let (size, mtime) = match graph.node_by_inode(entry.inode) {
                Some(id) => {
                    let attrs = graph.get_attr(id)?;
                    (attrs.size.to_string(), format_time(attrs.mtime))
                }
                None => ("-".to_string(), "-".to_string()),
            };
            let kind = match entry.kind {
                NodeKind::File => "file",
                NodeKind::Directory => "dir",
                NodeKind::Symlink => "link",
            };
            table.add_row(vec![entry.name, kind.to_string(), entry.inode.to_string(), size, mtime]);
        }
        Ok(table.to_string())
    }

    async fn cat(&self, path: &str) -> Result<String, FsError> {
        let mut graph = self.open_graph()?;
        let id = graph.resolve(path, &Offline).await?;
        let bytes = graph.read(id, &Offline).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::tree::EntryAttrs;

    fn context(dir: &std::path::Path) -> CliContext {
        let peer = PeerConfig {
            name: "desk".to_string(),
            pid: 4,
            mount: PathBuf::new(),
            store: dir.join("store"),
            addr: "127.0.0.1".to_string(),
            port: 1,
            nat_addr: None,
            nat_port: None,
        };
        CliContext::from_config(ReplicaConfig {
            replica: "desk".to_string(),
            key_dir: dir.join("keys"),
            peers: vec![peer],
            ..ReplicaConfig::default()
        })
    }

    #[tokio::test]
    async fn test_inspection_commands() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        {
            let store = SledBlockStore::open(&dir.path().join("store"), false).unwrap();
            let mut graph = NodeGraph::open(Arc::new(store.clone()), 4).unwrap();
            let root = graph.root();
            let f = graph.create(root, "notes", &EntryAttrs::file()).unwrap();
            graph.write(f, 0, b"remember", &Offline).await.unwrap();
            graph.flush_root().unwrap();
            store.flush().unwrap();
        }

        let head = ctx.execute(&Commands::Head { format: "json".to_string() }).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&head).unwrap();
        assert_eq!(value["replica_id"], 4);

        let history = ctx
            .execute(&Commands::History { limit: 10, format: "json".to_string() })
            .await
            .unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_str(&history).unwrap();
        assert_eq!(rows.len(), 2);

        let listing = ctx.execute(&Commands::Ls { path: "/".to_string() }).await.unwrap();
        assert!(listing.contains("notes"));

        let body = ctx.execute(&Commands::Cat { path: "notes".to_string() }).await.unwrap();
        assert_eq!(body, "remember");
    }
}
