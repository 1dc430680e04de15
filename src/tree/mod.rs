//! Versioned node graph
//!
//! Files and directories as content-addressed, versioned nodes. Nodes are
//! loaded lazily from the block store (or a peer), mutated in memory, and
//! flushed bottom-up into new immutable versions.

pub mod graph;
pub mod hasher;
pub mod history;
pub mod node;
pub mod source;

pub use graph::{NodeGraph, ReceiveOutcome, ROOT_INODE};
pub use history::{parse_time_spec, TimeSpec};
pub use node::{ChildSlot, DNode, DirEntry, EntryAttrs, NodeAttrs, NodeKind, NodeRecord, SetAttr};
pub use source::{Offline, RemoteSource};
