//! Cluster harness: N replicas on 127.0.0.1 with ephemeral ports

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use vdfs::channel::KeyRing;
use vdfs::config::{PeerConfig, ReplicaConfig};
use vdfs::net::client::DialOptions;
use vdfs::net::{PeerClient, Server};
use vdfs::store::SledBlockStore;
use vdfs::Replica;

pub const NAMES: [&str; 2] = ["hub", "edge"];

/// Keys are expensive to generate; every test shares one directory
fn key_dir() -> PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap().into_path();
        let keys = KeyRing::new(&dir);
        for name in NAMES {
            keys.generate(name, 1024).unwrap();
        }
        dir
    })
    .clone()
}

pub struct Cluster {
    pub replicas: Vec<Arc<Replica>>,
    pub addrs: Vec<String>,
    stops: Vec<watch::Sender<bool>>,
}

impl Cluster {
    pub fn get(&self, i: usize) -> &Arc<Replica> {
        &self.replicas[i]
    }

    /// A bare client that talks straight to replica `i`
    pub fn raw_client(&self, i: usize) -> PeerClient {
        let options = DialOptions {
            attempts: 5,
            backoff: std::time::Duration::from_millis(10),
            call_timeout: Some(std::time::Duration::from_secs(10)),
        };
        PeerClient::new(self.replicas[i].id(), NAMES[i], self.addrs[i].clone(), options)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for stop in &self.stops {
            let _ = stop.send(true);
        }
    }
}

/// Start `hub` (auth peer) and `edge`, with `tune` applied per replica
pub async fn cluster(tune: impl Fn(&str, &mut ReplicaConfig)) -> Cluster {
    let key_dir = key_dir();

    let mut servers = Vec::new();
    let mut addrs = Vec::new();
    for _ in NAMES {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        addrs.push(server.local_addr().unwrap().to_string());
        servers.push(server);
    }

    let peers: Vec<PeerConfig> = NAMES
        .iter()
        .zip(&addrs)
        .enumerate()
        .map(|(i, (name, addr))| {
            let port = addr.rsplit(':').next().unwrap().parse().unwrap();
            PeerConfig {
                name: name.to_string(),
                pid: i as u32 + 1,
                mount: PathBuf::from(format!("/mnt/{}", name)),
                store: PathBuf::from(format!("/var/lib/vdfs/{}", name)),
                addr: "127.0.0.1".to_string(),
                port,
                nat_addr: None,
                nat_port: None,
            }
        })
        .collect();

    let mut replicas = Vec::new();
    let mut stops = Vec::new();
    for (server, peer) in servers.into_iter().zip(&peers) {
        let mut config = ReplicaConfig {
            replica: peer.name.clone(),
            auth_peer: Some(NAMES[0].to_string()),
            key_dir: key_dir.clone(),
            dial_attempts: 5,
            dial_backoff_ms: 10,
            call_timeout_ms: 10_000,
            token_attempts: 5,
            token_retry_ms: 20,
            peers: peers.clone(),
            ..ReplicaConfig::default()
        };
        tune(&peer.name, &mut config);
        config.validate().unwrap();

        let store = Arc::new(SledBlockStore::temporary().unwrap());
        let replica = Arc::new(Replica::with_store(&config, peer, store, None).unwrap());
        let (stop, stopped) = watch::channel(false);
        tokio::spawn(server.serve(Arc::clone(&replica), stopped));
        replicas.push(replica);
        stops.push(stop);
    }

    for replica in &replicas {
        replica.authenticate().await.unwrap();
        assert!(replica.session().is_established());
    }

    Cluster {
        replicas,
        addrs,
        stops,
    }
}
