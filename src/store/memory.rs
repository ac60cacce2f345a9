//! Map-backed store for tests and caches.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::{Store, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.map.lock().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.map
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_miss() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get(b"missing").await,
            Err(StoreError::NotFound)
        ));
        store.put(b"k", b"v1").await.unwrap();
        store.put(b"k", b"v2").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn empty_values_survive() {
        let store = MemoryStore::new();
        store.put(b"k", b"").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), Vec::<u8>::new());
    }
}
