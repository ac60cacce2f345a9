//! Kernel adapter: exposes the node engine to the operating system through
//! FUSE. Each callback resolves the inode number to a node and calls the
//! corresponding engine operation; errno mapping lives here and nowhere
//! else.

pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
    ReplyXAttr,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::Result as FuseResult;
use rfuse3::{Errno, FileType, SetAttr, Timestamp};

use crate::node::node::Node;
use crate::node::{NodeAttr, NodeEngine, NodeError, SetAttrRequest};

const TTL: Duration = Duration::from_secs(1);

/// The mounted filesystem: a thin shim between FUSE requests and the node
/// engine.
pub struct SlateFs {
    engine: Arc<NodeEngine>,
}

impl SlateFs {
    pub fn new(engine: Arc<NodeEngine>) -> Self {
        Self { engine }
    }

    fn node(&self, ino: u64) -> FuseResult<Arc<Node>> {
        self.engine.node(ino).ok_or_else(|| Errno::from(libc::ENOENT))
    }
}

fn errno(e: NodeError) -> Errno {
    match e {
        NodeError::NotFound => libc::ENOENT.into(),
        NodeError::NotEmpty => libc::ENOTEMPTY.into(),
        NodeError::Exists => libc::EEXIST.into(),
        NodeError::NoData => libc::ENODATA.into(),
        NodeError::NotADirectory => libc::ENOTDIR.into(),
        NodeError::Store(_) => libc::EIO.into(),
    }
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn timestamp_of(nanos: u64) -> Timestamp {
    Timestamp::new((nanos / 1_000_000_000) as i64, (nanos % 1_000_000_000) as u32)
}

fn nanos_of(t: Timestamp) -> u64 {
    t.sec.max(0) as u64 * 1_000_000_000 + t.nsec as u64
}

fn fuse_attr(attr: &NodeAttr) -> FileAttr {
    let time = timestamp_of(attr.time_nanos);
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: time,
        mtime: time,
        ctime: time,
        kind: kind_of(attr.mode),
        perm: (attr.mode & 0o7777) as u16,
        nlink: 1,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: 4096,
    }
}

fn entry_reply(attr: &NodeAttr) -> ReplyEntry {
    ReplyEntry {
        ttl: TTL,
        attr: fuse_attr(attr),
        generation: 0,
    }
}

#[allow(refining_impl_trait_reachable)]
impl Filesystem for SlateFs {
    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let parent = self.node(parent)?;
        let name = name.to_string_lossy();
        let (_, attr) = self
            .engine
            .lookup(&parent, name.as_ref())
            .await
            .map_err(errno)?;
        Ok(entry_reply(&attr))
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let node = self.node(ino)?;
        let attr = self.engine.getattr(&node).await.map_err(errno)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: fuse_attr(&attr),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let node = self.node(ino)?;
        let request = SetAttrRequest {
            mode: set_attr.mode,
            uid: set_attr.uid,
            gid: set_attr.gid,
            size: set_attr.size,
            mtime_nanos: set_attr.mtime.map(nanos_of),
        };
        let attr = self.engine.setattr(&node, request).await.map_err(errno)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: fuse_attr(&attr),
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let parent = self.node(parent)?;
        let name = name.to_string_lossy();
        let (_, attr) = self
            .engine
            .mkdir(&parent, name.as_ref(), mode)
            .await
            .map_err(errno)?;
        Ok(entry_reply(&attr))
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let parent = self.node(parent)?;
        let name = name.to_string_lossy();
        let (_, attr) = self
            .engine
            .create(&parent, name.as_ref(), mode)
            .await
            .map_err(errno)?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: fuse_attr(&attr),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let parent = self.node(parent)?;
        let name = name.to_string_lossy();
        let target = link.to_string_lossy();
        let (_, attr) = self
            .engine
            .symlink(&parent, name.as_ref(), target.as_bytes())
            .await
            .map_err(errno)?;
        Ok(entry_reply(&attr))
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let node = self.node(ino)?;
        let target = self.engine.readlink(&node).await.map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(target),
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent = self.node(parent)?;
        let name = name.to_string_lossy();
        self.engine
            .unlink(&parent, name.as_ref())
            .await
            .map_err(errno)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent = self.node(parent)?;
        let name = name.to_string_lossy();
        self.engine
            .rmdir(&parent, name.as_ref())
            .await
            .map_err(errno)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old_parent = self.node(parent)?;
        let new_parent = self.node(new_parent)?;
        let name = name.to_string_lossy();
        let new_name = new_name.to_string_lossy();
        self.engine
            .rename(&old_parent, name.as_ref(), &new_parent, new_name.as_ref())
            .await
            .map_err(errno)
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let node = self.node(ino)?;
        self.engine.open(&node).await.map_err(errno)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let node = self.node(ino)?;
        self.engine.opendir(&node).await.map_err(errno)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let node = self.node(ino)?;
        let data = self
            .engine
            .read(&node, offset, size as usize)
            .await
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let node = self.node(ino)?;
        let written = self.engine.write(&node, offset, data).await.map_err(errno)?;
        Ok(ReplyWrite { written })
    }

    async fn flush(&self, _req: Request, ino: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        let node = self.node(ino)?;
        self.engine.flush(&node).await.map_err(errno)
    }

    // Syncs writes to mmap-ed files as well.
    async fn release(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        let node = self.node(ino)?;
        self.engine.flush(&node).await.map_err(errno)
    }

    async fn fsync(&self, _req: Request, ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        let node = self.node(ino)?;
        self.engine.flush(&node).await.map_err(errno)
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<BoxStream<'a, FuseResult<DirectoryEntry>>>> {
        let node = self.node(ino)?;
        let listing = self.engine.readdir(&node).await.map_err(errno)?;

        let mut all: Vec<DirectoryEntry> = Vec::new();
        if offset < 1 {
            all.push(DirectoryEntry {
                inode: ino,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
            });
        }
        if offset < 2 {
            all.push(DirectoryEntry {
                inode: ino,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            });
        }
        for (i, entry) in listing.iter().enumerate() {
            let entry_offset = i as i64 + 3;
            if entry_offset <= offset {
                continue;
            }
            all.push(DirectoryEntry {
                inode: entry.ino,
                kind: kind_of(entry.mode),
                name: OsString::from(entry.name.clone()),
                offset: entry_offset,
            });
        }

        let boxed: BoxStream<'a, FuseResult<DirectoryEntry>> =
            Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<BoxStream<'a, FuseResult<DirectoryEntryPlus>>>> {
        let node = self.node(ino)?;
        let self_attr = self.engine.getattr(&node).await.map_err(errno)?;
        let listing = self.engine.readdir(&node).await.map_err(errno)?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::new();
        if offset < 1 {
            all.push(DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
                attr: fuse_attr(&self_attr),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }
        if offset < 2 {
            all.push(DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
                attr: fuse_attr(&self_attr),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }
        for (i, entry) in listing.iter().enumerate() {
            let entry_offset = i as u64 + 3;
            if entry_offset <= offset {
                continue;
            }
            let Some(child) = self.engine.node(entry.ino) else {
                continue;
            };
            let attr = match self.engine.getattr(&child).await {
                Ok(attr) => attr,
                Err(_) => continue,
            };
            all.push(DirectoryEntryPlus {
                inode: entry.ino,
                generation: 0,
                kind: kind_of(entry.mode),
                name: OsString::from(entry.name.clone()),
                offset: entry_offset as i64,
                attr: fuse_attr(&attr),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let boxed: BoxStream<'a, FuseResult<DirectoryEntryPlus>> =
            Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn getxattr(
        &self,
        _req: Request,
        ino: u64,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        let node = self.node(ino)?;
        let name = name.to_string_lossy();
        let value = self
            .engine
            .getxattr(&node, name.as_ref())
            .await
            .map_err(errno)?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(value.len() as u32));
        }
        if value.len() > size as usize {
            return Err(libc::ERANGE.into());
        }
        Ok(ReplyXAttr::Data(Bytes::from(value)))
    }

    async fn setxattr(
        &self,
        _req: Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> FuseResult<()> {
        let node = self.node(ino)?;
        let name = name.to_string_lossy();
        self.engine
            .setxattr(&node, name.as_ref(), value, flags)
            .await
            .map_err(errno)
    }

    // Success with zeroed fields; nothing tracks usage yet.
    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 0,
            namelen: 0,
            frsize: 0,
        })
    }

    // No kernel reference tracking; nodes stay registered for invalidation.
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}
}
