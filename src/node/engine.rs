//! The node engine: registry of every node this mount knows about, the
//! `sync`/`reload` machinery against the metadata and blob stores, and the
//! filesystem operations with their staged rollback.
//!
//! Locking discipline: a node's mutex is held for the whole operation,
//! including store I/O. Creation locks the fresh child before the parent;
//! reload and removal lock parent before child; rename locks old parent,
//! child, then new parent (one lock when the parents coincide).

use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use tracing::{debug, error, info, warn};

use crate::codec::Message;
use crate::meta::ChangeListener;
use crate::node::metadata::{deserialize_node, serialize_node};
use crate::node::node::{ChildEntry, Node, NodeState};
use crate::node::{
    now_nanos, DirEntry, NodeAttr, NodeError, NodeKey, SetAttrRequest, MODE_NOT_LOADED,
    NODE_KEY_LEN, ROOT_KEY,
};
use crate::node::ino::{InoGenerator, ROOT_INO};
use crate::store::{BlobStore, StoreError, VersionedStore};

pub struct NodeEngine {
    metadata: Arc<dyn VersionedStore>,
    blobs: Arc<BlobStore>,
    inos: InoGenerator,
    known: DashMap<NodeKey, Arc<Node>>,
    by_ino: DashMap<u64, Arc<Node>>,
    root: Arc<Node>,
}

impl NodeEngine {
    pub fn new(metadata: Arc<dyn VersionedStore>, blobs: Arc<BlobStore>) -> Arc<Self> {
        let root = Node::new(ROOT_INO, NodeState::not_loaded("root", ROOT_KEY));
        let engine = Self {
            metadata,
            blobs,
            inos: InoGenerator::new(),
            known: DashMap::new(),
            by_ino: DashMap::new(),
            root: root.clone(),
        };
        engine.known.insert(ROOT_KEY, root.clone());
        engine.by_ino.insert(ROOT_INO, root);
        Arc::new(engine)
    }

    pub fn root(&self) -> Arc<Node> {
        self.root.clone()
    }

    pub fn node(&self, ino: u64) -> Option<Arc<Node>> {
        self.by_ino.get(&ino).map(|n| n.value().clone())
    }

    /// Load the root node's metadata, or serve an empty filesystem when the
    /// store has never seen this tree.
    pub async fn init_root(&self) -> Result<(), NodeError> {
        let mut state = self.root.state.lock().await;
        match self.load_into(&mut state, ROOT_KEY).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => {
                info!("serving an empty filesystem (no metadata found for the root node)");
                state.mode = libc::S_IFDIR as u32 | 0o755;
                state.time_nanos = now_nanos();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The change-listener half of cache invalidation: wraps this engine so
    /// the metadata client can hand it every broadcast. Listener work is
    /// spawned, never run inline, because flagging a node takes its lock.
    pub fn change_listener(self: &Arc<Self>) -> ChangeListener {
        let engine = self.clone();
        Arc::new(move |message: Message| {
            if let Message::Put { key, version, .. } = message {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.invalidate(&key, version).await;
                });
            }
        })
    }

    /// Flag a node for lazy reload if `key` names one we track and the
    /// broadcast version is strictly newer. Everything else is ignored:
    /// non-metadata keys, unknown nodes, and stale or echoed updates.
    pub async fn invalidate(&self, key: &[u8], version: u64) {
        if key.len() != NODE_KEY_LEN {
            debug!("not updating (not a metadata key)");
            return;
        }
        let mut node_key = NodeKey::default();
        node_key.copy_from_slice(key);
        let Some(node) = self.known.get(&node_key).map(|n| n.value().clone()) else {
            debug!(key = %hex::encode(&key[..5]), "not updating (unknown node)");
            return;
        };
        let mut state = node.state.lock().await;
        if version <= state.version {
            debug!(
                name = %state.name,
                local = state.version,
                remote = version,
                "not updating (stale update)"
            );
            return;
        }
        debug!(name = %state.name, local = state.version, remote = version, "marking for reload");
        state.should_reload_metadata = true;
    }

    // ===== registry =====

    /// Register a node discovered through a parent. Idempotent: a key we
    /// already track returns the existing node.
    fn adopt(&self, name: &str, key: NodeKey) -> Arc<Node> {
        if let Some(existing) = self.known.get(&key) {
            return existing.value().clone();
        }
        let node = Node::new(self.inos.next(), NodeState::not_loaded(name, key));
        match self.known.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(node.clone());
                self.by_ino.insert(node.ino, node.clone());
                debug!(key = %hex::encode(&key[..5]), name, "discovered node");
                node
            }
        }
    }

    /// Allocate a brand-new node with a random key, version 0.
    fn allocate(&self, name: &str) -> Arc<Node> {
        let mut key = NodeKey::default();
        rand::rng().fill_bytes(&mut key);
        let mut state = NodeState::not_loaded(name, key);
        state.time_nanos = now_nanos();
        state.mode = 0;
        let node = Node::new(self.inos.next(), state);
        self.known.insert(key, node.clone());
        self.by_ino.insert(node.ino, node.clone());
        debug!(key = %hex::encode(&key[..5]), name, "added node");
        node
    }

    /// Undo an `allocate` whose creation never committed: the node leaves
    /// the registry and the kernel-side inode table, as if it had never
    /// existed. The random key is never reused.
    fn forget_node(&self, ino: u64, key: &NodeKey) {
        self.known.remove(key);
        self.by_ino.remove(&ino);
        debug!(key = %hex::encode(&key[..5]), ino, "forgot node");
    }

    // ===== persistence plumbing (all called with the node lock held) =====

    /// Fill `state` from the metadata store, adopting placeholder children.
    async fn load_into(&self, state: &mut NodeState, key: NodeKey) -> Result<(), StoreError> {
        let (version, raw) = self.metadata.get(&key).await?;
        let decoded = deserialize_node(&raw)?;
        state.key = key;
        state.version = version;
        state.user = decoded.user;
        state.group = decoded.group;
        state.mode = decoded.mode;
        state.time_nanos = decoded.time_nanos;
        state.xattrs = decoded.xattrs;
        state.content_key = decoded.content_key;
        state.content = None;
        state.children.clear();
        for (name, child_key) in decoded.children {
            let node = self.adopt(&name, child_key);
            state.children.insert(
                name,
                ChildEntry {
                    key: child_key,
                    node,
                },
            );
        }
        Ok(())
    }

    async fn ensure_loaded(&self, state: &mut NodeState) -> Result<(), StoreError> {
        if state.mode != MODE_NOT_LOADED {
            return Ok(());
        }
        let key = state.key;
        self.load_into(state, key).await
    }

    /// Lazy reload: called at the top of read-side operations. A no-op
    /// unless a broadcast flagged this node as stale.
    async fn reload_locked(&self, state: &mut NodeState) -> Result<(), StoreError> {
        if !state.should_reload_metadata {
            return Ok(());
        }
        let (version, raw) = match self.metadata.get(&state.key).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(name = %state.name, err = %e, "could not reload");
                return Err(e);
            }
        };
        let decoded = deserialize_node(&raw)?;
        state.user = decoded.user;
        state.group = decoded.group;
        state.mode = decoded.mode;
        state.time_nanos = decoded.time_nanos;
        state.xattrs = decoded.xattrs;
        if state.version != version {
            debug!(name = %state.name, from = state.version, to = version, "version changed");
            state.version = version;
        }
        if state.content_key != decoded.content_key {
            debug!(name = %state.name, "content changed, marking for lazy reload");
            state.content_key = decoded.content_key;
            state.content = None;
        }

        // Children are by far the hardest part to reload: names can appear,
        // vanish, or silently point at a different node.
        for (name, new_key) in &decoded.children {
            match state.children.get_mut(name) {
                Some(entry) if entry.key == *new_key => {}
                Some(entry) => {
                    debug!(%name, "child changed key, updating and marking for reload");
                    entry.key = *new_key;
                    let child = entry.node.clone();
                    let mut child_state = child.state.lock().await;
                    child_state.key = *new_key;
                    child_state.should_reload_metadata = true;
                    drop(child_state);
                    self.known.insert(*new_key, child);
                }
                None => {
                    debug!(%name, "child is new, adding for lazy loading");
                    let node = self.adopt(name, *new_key);
                    state.children.insert(
                        name.clone(),
                        ChildEntry {
                            key: *new_key,
                            node,
                        },
                    );
                }
            }
        }
        state
            .children
            .retain(|name, _| decoded.children.iter().any(|(n, _)| n == name));

        state.should_save_metadata = false;
        state.should_reload_metadata = false;
        state.should_save_content = false;
        Ok(())
    }

    /// The single persistence primitive: flush dirty content to the blob
    /// store, then dirty metadata to the versioned store, clearing each
    /// flag only on success. A stale put marks the node for reload so the
    /// next access refreshes it from authoritative metadata.
    async fn sync_locked(&self, state: &mut NodeState) -> Result<(), StoreError> {
        if state.should_save_content {
            let content = state.content.as_deref().unwrap_or_default();
            let new_key = match self.blobs.put(content).await {
                Ok(key) => key,
                Err(e) => {
                    error!(name = %state.name, err = %e, "could not save content");
                    return Err(e);
                }
            };
            state.should_save_content = false;
            if new_key != state.content_key {
                state.content_key = new_key;
                state.should_save_metadata = true;
            }
        }
        if state.should_save_metadata {
            let value = serialize_node(state);
            match self
                .metadata
                .put(state.version + 1, &state.key, &value)
                .await
            {
                Ok(()) => {
                    state.version += 1;
                    state.should_save_metadata = false;
                }
                Err(e) => {
                    if matches!(e, StoreError::StalePut) {
                        state.should_reload_metadata = true;
                    }
                    error!(name = %state.name, err = %e, "could not save metadata");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Fetch the blob behind `content_key` into the node's content cache.
    /// Dirty content is already current, directories have none, and an
    /// empty content key means a zero-length file.
    async fn ensure_content_loaded(&self, state: &mut NodeState) -> Result<(), StoreError> {
        if state.should_save_content {
            return Ok(());
        }
        if !state.is_file() && !state.is_symlink() {
            return Ok(());
        }
        if state.content.is_some() {
            return Ok(());
        }
        if state.content_key.is_empty() {
            state.content = Some(Vec::new());
            return Ok(());
        }
        match self.blobs.get(&state.content_key).await {
            Ok(value) => {
                state.content = Some(value);
                Ok(())
            }
            Err(e) => {
                error!(name = %state.name, err = %e, "could not load content");
                Err(e)
            }
        }
    }

    fn attr_of(state: &NodeState, ino: u64) -> NodeAttr {
        NodeAttr {
            ino,
            mode: state.mode,
            uid: state.user,
            gid: state.group,
            size: state.content_len(),
            time_nanos: state.time_nanos,
        }
    }

    // ===== read-side operations =====

    pub async fn getattr(&self, node: &Arc<Node>) -> Result<NodeAttr, NodeError> {
        let mut state = node.state.lock().await;
        self.reload_locked(&mut state).await?;
        self.ensure_content_loaded(&mut state).await?;
        Ok(Self::attr_of(&state, node.ino))
    }

    /// Resolve `name` under `parent`, loading the child's metadata (and its
    /// content, because the kernel expects a size in the reply; the tree
    /// does not persist sizes separately).
    pub async fn lookup(
        &self,
        parent: &Arc<Node>,
        name: &str,
    ) -> Result<(Arc<Node>, NodeAttr), NodeError> {
        let mut pstate = parent.state.lock().await;
        self.reload_locked(&mut pstate).await?;
        let entry = pstate.children.get(name).cloned().ok_or(NodeError::NotFound)?;
        let mut cstate = entry.node.state.lock().await;
        self.ensure_loaded(&mut cstate).await?;
        self.ensure_content_loaded(&mut cstate).await?;
        Ok((entry.node.clone(), Self::attr_of(&cstate, entry.node.ino)))
    }

    /// Make sure every child's metadata is loaded, so a following readdir
    /// answers from memory.
    pub async fn opendir(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let mut state = node.state.lock().await;
        self.reload_locked(&mut state).await?;
        if !state.is_dir() {
            return Err(NodeError::NotADirectory);
        }
        let entries: Vec<ChildEntry> = state.children.values().cloned().collect();
        for entry in entries {
            let mut cstate = entry.node.state.lock().await;
            self.ensure_loaded(&mut cstate).await?;
        }
        Ok(())
    }

    pub async fn readdir(&self, node: &Arc<Node>) -> Result<Vec<DirEntry>, NodeError> {
        let mut state = node.state.lock().await;
        self.reload_locked(&mut state).await?;
        if !state.is_dir() {
            return Err(NodeError::NotADirectory);
        }
        let entries: Vec<(String, ChildEntry)> = state
            .children
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        let mut listing = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let mut cstate = entry.node.state.lock().await;
            self.ensure_loaded(&mut cstate).await?;
            listing.push(DirEntry {
                name,
                ino: entry.node.ino,
                mode: cstate.mode,
            });
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    pub async fn readlink(&self, node: &Arc<Node>) -> Result<Vec<u8>, NodeError> {
        let mut state = node.state.lock().await;
        self.reload_locked(&mut state).await?;
        self.ensure_content_loaded(&mut state).await?;
        Ok(state.content.clone().unwrap_or_default())
    }

    pub async fn open(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let mut state = node.state.lock().await;
        self.reload_locked(&mut state).await?;
        self.ensure_content_loaded(&mut state).await?;
        Ok(())
    }

    pub async fn read(&self, node: &Arc<Node>, offset: u64, size: usize) -> Result<Vec<u8>, NodeError> {
        let state = node.state.lock().await;
        let content = state.content.as_deref().unwrap_or_default();
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(Vec::new());
        }
        let end = (offset + size).min(content.len());
        Ok(content[offset..end].to_vec())
    }

    pub async fn getxattr(&self, node: &Arc<Node>, name: &str) -> Result<Vec<u8>, NodeError> {
        let state = node.state.lock().await;
        state.xattrs.get(name).cloned().ok_or(NodeError::NoData)
    }

    // ===== write-side operations (staged rollback) =====

    pub async fn setxattr(
        &self,
        node: &Arc<Node>,
        name: &str,
        value: &[u8],
        flags: u32,
    ) -> Result<(), NodeError> {
        let mut state = node.state.lock().await;
        let exists = state.xattrs.contains_key(name);
        if flags == libc::XATTR_CREATE as u32 && exists {
            return Err(NodeError::Exists);
        }
        if flags == libc::XATTR_REPLACE as u32 && !exists {
            return Err(NodeError::NoData);
        }
        let previous = state.xattrs.insert(name.to_string(), value.to_vec());
        state.should_save_metadata = true;
        if let Err(e) = self.sync_locked(&mut state).await {
            match previous {
                Some(previous) => {
                    state.xattrs.insert(name.to_string(), previous);
                }
                None => {
                    state.xattrs.remove(name);
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn setattr(
        &self,
        node: &Arc<Node>,
        req: SetAttrRequest,
    ) -> Result<NodeAttr, NodeError> {
        let mut state = node.state.lock().await;

        let mut prev_time = None;
        let mut prev_user = None;
        let mut prev_group = None;
        let mut prev_mode = None;
        let mut prev_content = None;
        let mut prev_content_key = None;
        let mut prev_save_content = None;

        if let Some(t) = req.mtime_nanos {
            prev_time = Some(state.time_nanos);
            state.time_nanos = t;
        }
        if let Some(uid) = req.uid {
            prev_user = Some(state.user);
            state.user = uid;
        }
        if let Some(gid) = req.gid {
            prev_group = Some(state.group);
            state.group = gid;
        }
        if let Some(mode) = req.mode {
            prev_mode = Some(state.mode);
            // Only permission bits may change; the file-type tag stays.
            state.mode = state.mode & 0xffff_f000 | mode & 0x0000_0fff;
        }
        if let Some(size) = req.size {
            prev_content_key = Some(state.content_key.clone());
            prev_save_content = Some(state.should_save_content);
            prev_content = Some(state.resize_content(size));
            if prev_time.is_none() {
                prev_time = Some(state.time_nanos);
            }
            state.time_nanos = now_nanos();
            state.should_save_content = true;
        }
        state.should_save_metadata = true;

        if let Err(e) = self.sync_locked(&mut state).await {
            if let Some(t) = prev_time {
                state.time_nanos = t;
            }
            if let Some(uid) = prev_user {
                state.user = uid;
            }
            if let Some(gid) = prev_group {
                state.group = gid;
            }
            if let Some(mode) = prev_mode {
                state.mode = mode;
            }
            if let Some(content) = prev_content {
                state.content = content;
            }
            if let Some(content_key) = prev_content_key {
                state.content_key = content_key;
            }
            if let Some(flag) = prev_save_content {
                state.should_save_content = flag;
            }
            return Err(e.into());
        }
        Ok(Self::attr_of(&state, node.ino))
    }

    pub async fn create(
        &self,
        parent: &Arc<Node>,
        name: &str,
        mode: u32,
    ) -> Result<(Arc<Node>, NodeAttr), NodeError> {
        self.create_child(parent, name, mode | libc::S_IFREG as u32, None)
            .await
    }

    pub async fn mkdir(
        &self,
        parent: &Arc<Node>,
        name: &str,
        mode: u32,
    ) -> Result<(Arc<Node>, NodeAttr), NodeError> {
        self.create_child(parent, name, mode | libc::S_IFDIR as u32, None)
            .await
    }

    pub async fn symlink(
        &self,
        parent: &Arc<Node>,
        name: &str,
        target: &[u8],
    ) -> Result<(Arc<Node>, NodeAttr), NodeError> {
        self.create_child(
            parent,
            name,
            libc::S_IFLNK as u32 | 0o777,
            Some(target.to_vec()),
        )
        .await
    }

    /// Shared create/mkdir/symlink path: allocate, attach, sync child then
    /// parent. Any failure detaches the child from the parent and drops it
    /// from the registry and the kernel-side inode table again. Lock order
    /// is child before parent; the fresh child is unreachable, so its lock
    /// is uncontended.
    async fn create_child(
        &self,
        parent: &Arc<Node>,
        name: &str,
        mode: u32,
        content: Option<Vec<u8>>,
    ) -> Result<(Arc<Node>, NodeAttr), NodeError> {
        let child = self.allocate(name);
        let mut cstate = child.state.lock().await;
        let mut pstate = parent.state.lock().await;
        if !pstate.is_dir() {
            self.forget_node(child.ino, &cstate.key);
            return Err(NodeError::NotADirectory);
        }
        if pstate.children.contains_key(name) {
            self.forget_node(child.ino, &cstate.key);
            return Err(NodeError::Exists);
        }

        cstate.mode = mode;
        if let Some(content) = content {
            cstate.content = Some(content);
            cstate.should_save_content = true;
        }
        pstate.children.insert(
            name.to_string(),
            ChildEntry {
                key: cstate.key,
                node: child.clone(),
            },
        );

        cstate.should_save_metadata = true;
        if let Err(e) = self.sync_locked(&mut cstate).await {
            pstate.children.remove(name);
            self.forget_node(child.ino, &cstate.key);
            return Err(e.into());
        }
        pstate.should_save_metadata = true;
        if let Err(e) = self.sync_locked(&mut pstate).await {
            pstate.children.remove(name);
            self.forget_node(child.ino, &cstate.key);
            return Err(e.into());
        }
        Ok((child.clone(), Self::attr_of(&cstate, child.ino)))
    }

    pub async fn unlink(&self, parent: &Arc<Node>, name: &str) -> Result<(), NodeError> {
        let mut pstate = parent.state.lock().await;
        let entry = pstate.children.remove(name).ok_or(NodeError::NotFound)?;
        pstate.should_save_metadata = true;
        if let Err(e) = self.sync_locked(&mut pstate).await {
            pstate.children.insert(name.to_string(), entry);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn rmdir(&self, parent: &Arc<Node>, name: &str) -> Result<(), NodeError> {
        let mut pstate = parent.state.lock().await;
        let Some(entry) = pstate.children.get(name).cloned() else {
            warn!(name, "asked to remove directory that does not exist");
            return Err(NodeError::NotFound);
        };
        let cstate = entry.node.state.lock().await;
        if !cstate.children.is_empty() {
            return Err(NodeError::NotEmpty);
        }
        pstate.children.remove(name);
        pstate.should_save_metadata = true;
        if let Err(e) = self.sync_locked(&mut pstate).await {
            pstate.children.insert(name.to_string(), entry.clone());
            return Err(e.into());
        }
        Ok(())
    }

    /// Move a child between directories. This touches three nodes and has
    /// no rollback: a failure partway through can leave the in-memory tree
    /// and the store disagreeing until the next reload. Making this
    /// transactional needs a multi-key put in the metadata protocol.
    pub async fn rename(
        &self,
        old_parent: &Arc<Node>,
        name: &str,
        new_parent: &Arc<Node>,
        new_name: &str,
    ) -> Result<(), NodeError> {
        let mut old_state = old_parent.state.lock().await;
        let entry = old_state
            .children
            .get(name)
            .cloned()
            .ok_or(NodeError::NotFound)?;
        let child_node = entry.node.clone();
        let mut child_state = child_node.state.lock().await;
        child_state.name = new_name.to_string();

        if Arc::ptr_eq(old_parent, new_parent) {
            old_state.children.remove(name);
            old_state.children.insert(new_name.to_string(), entry);
            child_state.should_save_metadata = true;
            old_state.should_save_metadata = true;
            self.sync_locked(&mut child_state).await?;
            self.sync_locked(&mut old_state).await?;
        } else {
            let mut new_state = new_parent.state.lock().await;
            new_state.children.insert(new_name.to_string(), entry);
            old_state.children.remove(name);
            child_state.should_save_metadata = true;
            new_state.should_save_metadata = true;
            old_state.should_save_metadata = true;
            self.sync_locked(&mut child_state).await?;
            self.sync_locked(&mut new_state).await?;
            self.sync_locked(&mut old_state).await?;
        }
        Ok(())
    }

    pub async fn write(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> Result<u32, NodeError> {
        let mut state = node.state.lock().await;
        self.ensure_content_loaded(&mut state).await?;
        let end = offset as usize + data.len();
        let content = state.content.get_or_insert_with(Vec::new);
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        state.time_nanos = now_nanos();
        if !data.is_empty() {
            state.should_save_content = true;
        }
        Ok(data.len() as u32)
    }

    /// Flush deferred writes. If the sync fails after the content key moved
    /// (content saved, metadata not), the key is rolled back so the node's
    /// metadata keeps pointing at the blob it actually describes.
    pub async fn flush(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let mut state = node.state.lock().await;
        let previous = state.content_key.clone();
        if let Err(e) = self.sync_locked(&mut state).await {
            if state.content_key != previous {
                state.content_key = previous;
                state.content = None;
            }
            return Err(e.into());
        }
        Ok(())
    }
}
