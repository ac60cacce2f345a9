//! The in-memory node: one per file, directory, or symlink the mount has
//! seen. All mutable state lives behind a per-node async mutex that is held
//! for the whole duration of a filesystem operation, including store I/O;
//! from the kernel's point of view each operation is atomic and dirty state
//! is never partially visible.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::node::{NodeKey, MODE_NOT_LOADED};

/// A directory's reference to one child. The key copy lets a parent
/// serialize itself without taking child locks; reload keeps the copy and
/// the child's own state in step.
#[derive(Clone, Debug)]
pub struct ChildEntry {
    pub key: NodeKey,
    pub node: Arc<Node>,
}

#[derive(Debug)]
pub struct Node {
    /// Kernel-facing inode number, assigned once at allocation.
    pub ino: u64,
    pub state: Mutex<NodeState>,
}

#[derive(Debug)]
pub struct NodeState {
    /// Metadata-store key. Assigned at creation; replaced only when a
    /// parent's reload discovers the name now points at a different node.
    pub key: NodeKey,
    /// Last name this node was seen under; only used in log output.
    pub name: String,
    /// Version of this node's metadata in the versioned store. Bumped by
    /// exactly one for each accepted save.
    pub version: u64,

    pub user: u32,
    pub group: u32,
    pub mode: u32,
    pub time_nanos: u64,
    pub xattrs: HashMap<String, Vec<u8>>,

    /// Blob hash of the current content; empty when the node has none.
    /// Meaningful for regular files and symlinks only.
    pub content_key: Vec<u8>,
    /// Cached content. `None` means not fetched yet; dirty content lives
    /// here until `sync` pushes it to the blob store.
    pub content: Option<Vec<u8>>,

    /// Directory entries by name. Persisted inline in this node's
    /// metadata value as name→key pairs.
    pub children: HashMap<String, ChildEntry>,

    pub should_save_metadata: bool,
    pub should_reload_metadata: bool,
    pub should_save_content: bool,
}

impl Node {
    pub fn new(ino: u64, state: NodeState) -> Arc<Self> {
        Arc::new(Self {
            ino,
            state: Mutex::new(state),
        })
    }
}

impl NodeState {
    /// A node discovered via a parent directory: key known, everything else
    /// pending a metadata fetch.
    pub fn not_loaded(name: impl Into<String>, key: NodeKey) -> Self {
        Self {
            key,
            name: name.into(),
            version: 0,
            user: 0,
            group: 0,
            mode: MODE_NOT_LOADED,
            time_nanos: 0,
            xattrs: HashMap::new(),
            content_key: Vec::new(),
            content: None,
            children: HashMap::new(),
            should_save_metadata: false,
            should_reload_metadata: false,
            should_save_content: false,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode != MODE_NOT_LOADED && self.mode & libc::S_IFDIR as u32 != 0
    }

    pub fn is_symlink(&self) -> bool {
        self.mode != MODE_NOT_LOADED && self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }

    pub fn is_file(&self) -> bool {
        self.mode != MODE_NOT_LOADED && self.mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
    }

    pub fn content_len(&self) -> u64 {
        self.content.as_ref().map(|c| c.len() as u64).unwrap_or(0)
    }

    /// Grow or shrink the cached content, returning the previous buffer for
    /// rollback.
    pub fn resize_content(&mut self, size: u64) -> Option<Vec<u8>> {
        let previous = self.content.clone();
        let content = self.content.get_or_insert_with(Vec::new);
        content.resize(size as usize, 0);
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_classification() {
        let mut state = NodeState::not_loaded("x", [1; 20]);
        assert!(!state.is_dir());
        assert!(!state.is_file());

        state.mode = libc::S_IFDIR as u32 | 0o755;
        assert!(state.is_dir());

        state.mode = libc::S_IFREG as u32 | 0o644;
        assert!(state.is_file());
        assert!(!state.is_symlink());

        state.mode = libc::S_IFLNK as u32 | 0o777;
        assert!(state.is_symlink());
    }

    #[test]
    fn resize_keeps_prefix_and_reports_previous() {
        let mut state = NodeState::not_loaded("f", [2; 20]);
        state.content = Some(b"anything".to_vec());

        let prev = state.resize_content(3);
        assert_eq!(prev.unwrap(), b"anything");
        assert_eq!(state.content.as_deref().unwrap(), b"any");

        let prev = state.resize_content(5);
        assert_eq!(prev.unwrap(), b"any");
        assert_eq!(state.content.as_deref().unwrap(), b"any\0\0");
    }
}
