//! Optimistic concurrency on top of a raw store: every value carries a
//! version, and a writer must name the successor of the version it has seen.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::{Store, StoreError};

/// A mapping from key to `(version, value)`. `put` must be called with the
/// intended next version and fails with [`StoreError::StalePut`] when the
/// caller has not seen the current one; the store is authoritative, so every
/// client observes the same sequence of accepted versions per key.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &[u8]) -> Result<(u64, Vec<u8>), StoreError>;
}

/// Versioned view over any raw store, persisting `version:u64 BE || value`.
/// The read-then-write in `put` is guarded by one store-wide lock; that
/// serializes all writers, which is the quickest correct implementation
/// (per-key sharding would be an optimization, not a contract change).
pub struct VersionedWrapper {
    delegate: Arc<dyn Store>,
    write_lock: Mutex<()>,
}

impl VersionedWrapper {
    pub fn new(delegate: Arc<dyn Store>) -> Self {
        Self {
            delegate,
            write_lock: Mutex::new(()),
        }
    }

    fn split(raw: &[u8]) -> Result<(u64, &[u8]), StoreError> {
        if raw.len() < 8 {
            return Err(StoreError::Underflow);
        }
        let version = u64::from_be_bytes(raw[..8].try_into().unwrap());
        Ok((version, &raw[8..]))
    }
}

#[async_trait]
impl VersionedStore for VersionedWrapper {
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = match self.delegate.get(key).await {
            Ok(raw) => Some(Self::split(&raw)?.0),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e),
        };
        if let Some(current) = current {
            if version < current + 1 {
                return Err(StoreError::StalePut);
            }
        }
        let mut framed = Vec::with_capacity(8 + value.len());
        framed.extend_from_slice(&version.to_be_bytes());
        framed.extend_from_slice(value);
        self.delegate.put(key, &framed).await
    }

    async fn get(&self, key: &[u8]) -> Result<(u64, Vec<u8>), StoreError> {
        let raw = self.delegate.get(key).await?;
        let (version, value) = Self::split(&raw)?;
        Ok((version, value.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn wrapper() -> VersionedWrapper {
        VersionedWrapper::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn accepts_successor_versions_only() {
        let store = wrapper();
        store.put(1, b"name", b"alpha").await.unwrap();
        assert_eq!(store.get(b"name").await.unwrap(), (1, b"alpha".to_vec()));

        // Same version again: the writer has not seen version 1's value.
        assert!(matches!(
            store.put(1, b"name", b"beta").await,
            Err(StoreError::StalePut)
        ));
        assert!(matches!(
            store.put(0, b"name", b"beta").await,
            Err(StoreError::StalePut)
        ));

        store.put(2, b"name", b"beta").await.unwrap();
        assert_eq!(store.get(b"name").await.unwrap(), (2, b"beta".to_vec()));
    }

    #[tokio::test]
    async fn first_put_may_skip_ahead() {
        // A client that never saw the key can propose any starting version.
        let store = wrapper();
        store.put(444, b"foo", b"bar").await.unwrap();
        assert_eq!(store.get(b"foo").await.unwrap(), (444, b"bar".to_vec()));
        assert!(matches!(
            store.put(444, b"foo", b"baz").await,
            Err(StoreError::StalePut)
        ));
        store.put(445, b"foo", b"baz").await.unwrap();
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = wrapper();
        assert!(matches!(
            store.get(b"nope").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn concurrent_writers_agree_on_one_winner() {
        let store = Arc::new(wrapper());
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.put(1, b"seat", &[i]).await.is_ok()
            }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let (version, _) = store.get(b"seat").await.unwrap();
        assert_eq!(version, 1);
    }
}
