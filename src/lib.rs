//! SlateFS: a distributed POSIX-style filesystem with a versioned metadata
//! service, a content-addressed blob service, and a FUSE mount client.
//! Multiple mounts share the services and observe each other's changes via
//! server-side broadcast of accepted metadata updates.

pub mod blob;
pub mod codec;
pub mod fuse;
pub mod meta;
pub mod node;
pub mod store;

pub use crate::codec::Message;
pub use crate::fuse::SlateFs;
pub use crate::meta::{
    ChangeListener, ClientOptions, MetaClient, MetaServer, RemoteOptions, RemoteVersionedStore,
    ServerOptions, TlsKeyPair,
};
pub use crate::node::{NodeEngine, NodeError, ROOT_KEY};
pub use crate::store::{
    open_store, BlobStore, CaskStore, DiskStore, HttpStore, MemoryStore, PairedStore, Store,
    StoreError, StoreUri, VersionedStore, VersionedWrapper,
};
