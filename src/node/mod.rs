//! Filesystem node engine: the in-memory tree behind the mount, its
//! persistence to the versioned metadata store and the blob store, and the
//! bookkeeping that keeps it honest across concurrent mounts (dirty flags,
//! lazy reload, staged rollback).

pub mod engine;
pub mod ino;
pub mod metadata;
pub mod node;

pub use engine::NodeEngine;
pub use ino::InoGenerator;
pub use node::{Node, NodeState};

use crate::store::StoreError;

/// Length of a node key: a random, never-reused identifier that doubles as
/// the node's key in the metadata store.
pub const NODE_KEY_LEN: usize = 20;

pub type NodeKey = [u8; NODE_KEY_LEN];

/// The root directory always lives under the all-zero key, so every mount
/// of the same metadata store finds the same tree.
pub const ROOT_KEY: NodeKey = [0; NODE_KEY_LEN];

/// Sentinel mode for a node discovered through its parent but not yet
/// fetched from the metadata store.
pub const MODE_NOT_LOADED: u32 = u32::MAX;

/// Operation outcome surfaced to the kernel adapter. Everything that the
/// kernel can act on is a distinct variant; store failures collapse into
/// `Store` and reach the kernel as `EIO`.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("not found")]
    NotFound,

    #[error("directory not empty")]
    NotEmpty,

    #[error("already exists")]
    Exists,

    #[error("no data")]
    NoData,

    #[error("not a directory")]
    NotADirectory,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Attributes reported to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub time_nanos: u64,
}

/// One directory entry as reported by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub mode: u32,
}

/// Fields a `setattr` call wants changed; everything absent stays as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime_nanos: Option<u64>,
}

pub(crate) fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
