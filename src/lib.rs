//! vdfs: Versioned Distributed File Store
//!
//! A content-addressed block store, a lazily materialized tree of versioned
//! nodes flushed bottom-up into immutable versions, and push/pull replication
//! between peers over an RSA-keyed, AES-CTR + HMAC sealed channel.

pub mod channel;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod heads;
pub mod logging;
pub mod net;
pub mod replica;
pub mod replication;
pub mod store;
pub mod tooling;
pub mod tree;
pub mod types;

pub use error::{FsError, StorageError};
pub use replica::Replica;
pub use types::{Hash, Inode, NodeId, ReplicaId};
