//! Storage backends: the raw byte-keyed `Store` contract, the wrappers that
//! add versioning, content addressing and local/remote pairing, and the
//! error surface shared by every layer up to the mount client.

pub mod blob;
pub mod cask;
pub mod disk;
pub mod http;
pub mod memory;
pub mod paired;
pub mod versioned;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use blob::BlobStore;
pub use cask::CaskStore;
pub use disk::DiskStore;
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use paired::PairedStore;
pub use versioned::{VersionedStore, VersionedWrapper};

/// Error surface for every store layer and the metadata protocol on top.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is not in the store.
    #[error("not found")]
    NotFound,

    /// A versioned put whose version is not the stored version plus one.
    /// The writer has not seen the latest value and must re-read.
    #[error("stale put")]
    StalePut,

    /// Short read or short write in the codec.
    #[error("underflow")]
    Underflow,

    /// Unknown or malformed message.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// A request exceeded its deadline.
    #[error("timeout")]
    Timeout,

    /// Required auth missing or rejected.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Starting a server that requires a password without a TLS key pair.
    #[error("must use TLS if authorization is required")]
    PasswordWithoutTls,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else from a wrapped store or the network layer.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn other(err: impl std::fmt::Display) -> Self {
        StoreError::Other(err.to_string())
    }
}

/// A mapping from byte-string keys to byte-string values. Last writer wins;
/// `get` fails with [`StoreError::NotFound`] for unknown keys.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;
}

/// Store configuration parsed from a `type://path` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUri {
    pub kind: String,
    pub path: String,
}

impl StoreUri {
    pub fn parse(uri: &str) -> Result<Self, StoreError> {
        match uri.split_once("://") {
            Some((kind, path)) => Ok(Self {
                kind: kind.to_ascii_lowercase(),
                path: path.to_string(),
            }),
            None => Err(StoreError::BadMessage(format!("invalid store uri: {uri}"))),
        }
    }
}

impl std::fmt::Display for StoreUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.kind, self.path)
    }
}

/// Open a raw store described by a `type://path` URI. Supported types are
/// `memory` (ignores the path), `disk`, and `cask` (accepted under its
/// legacy spelling `bitcask` as well).
pub async fn open_store(uri: &str) -> Result<Arc<dyn Store>, StoreError> {
    let parsed = StoreUri::parse(uri)?;
    match parsed.kind.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "disk" => Ok(Arc::new(DiskStore::new(&parsed.path))),
        "cask" | "bitcask" => Ok(Arc::new(CaskStore::open(&parsed.path).await?)),
        other => Err(StoreError::BadMessage(format!(
            "invalid or unsupported store type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_uris() {
        let uri = StoreUri::parse("disk:///var/lib/slate").unwrap();
        assert_eq!(uri.kind, "disk");
        assert_eq!(uri.path, "/var/lib/slate");
        assert_eq!(uri.to_string(), "disk:///var/lib/slate");

        let uri = StoreUri::parse("MEMORY://").unwrap();
        assert_eq!(uri.kind, "memory");

        assert!(StoreUri::parse("just-a-path").is_err());
    }

    #[tokio::test]
    async fn factory_rejects_unknown_types() {
        assert!(matches!(
            open_store("papyrus://x").await,
            Err(StoreError::BadMessage(_))
        ));
    }

    #[tokio::test]
    async fn factory_opens_memory_store() {
        let store = open_store("memory://").await.unwrap();
        store.put(b"k", b"v").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), b"v");
    }
}
