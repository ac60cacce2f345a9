//! File-per-key store sharded by the first two hex characters of the key,
//! so no single directory collects every entry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::store::{Store, StoreError};

pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        let hexed = hex::encode(key);
        let shard = if hexed.len() >= 2 { &hexed[..2] } else { "00" };
        self.dir.join(shard).join(hexed)
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::write(&path, value).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Shard directory does not exist yet.
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&path, value).await.map_err(StoreError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_creates_shard_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(tmp.path());
        store.put(&[0xab, 0xcd], b"payload").await.unwrap();
        assert_eq!(store.get(&[0xab, 0xcd]).await.unwrap(), b"payload");
        assert!(tmp.path().join("ab").join("abcd").is_file());
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(tmp.path());
        assert!(matches!(
            store.get(&[0x01]).await,
            Err(StoreError::NotFound)
        ));
    }
}
