//! Content-addressed wrapper: a value's key is the Blake2b-512 hash of the
//! value itself, so identical content lands on identical keys and nothing
//! is ever overwritten with different bytes.

use std::sync::Arc;

use blake2b_simd::Params;

use crate::store::{Store, StoreError};

pub const BLOB_KEY_LEN: usize = 64;

pub struct BlobStore {
    delegate: Arc<dyn Store>,
}

impl BlobStore {
    pub fn new(delegate: Arc<dyn Store>) -> Self {
        Self { delegate }
    }

    pub fn hash(value: &[u8]) -> Vec<u8> {
        Params::new()
            .hash_length(BLOB_KEY_LEN)
            .hash(value)
            .as_bytes()
            .to_vec()
    }

    /// Store `value` under its own hash and return the key. Concurrent puts
    /// of the same content race harmlessly: they write identical bytes.
    pub async fn put(&self, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        let key = Self::hash(value);
        self.delegate.put(&key, value).await?;
        Ok(key)
    }

    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.delegate.get(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rand::RngCore;

    fn random_bytes() -> Vec<u8> {
        let mut rng = rand::rng();
        let mut b = vec![0u8; (rng.next_u32() % 64) as usize];
        rng.fill_bytes(&mut b);
        b
    }

    #[tokio::test]
    async fn same_value_same_key() {
        let store = BlobStore::new(Arc::new(MemoryStore::new()));
        let value = random_bytes();
        let key1 = store.put(&value).await.unwrap();
        let key2 = store.put(&value).await.unwrap();
        assert_eq!(key1.len(), BLOB_KEY_LEN);
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn different_values_different_keys() {
        let store = BlobStore::new(Arc::new(MemoryStore::new()));
        let key1 = store.put(b"one").await.unwrap();
        let key2 = store.put(b"two").await.unwrap();
        assert_eq!(key1.len(), BLOB_KEY_LEN);
        assert_eq!(key2.len(), BLOB_KEY_LEN);
        assert_ne!(key1, key2);
    }

    #[tokio::test]
    async fn what_you_put_is_what_you_get() {
        let store = BlobStore::new(Arc::new(MemoryStore::new()));
        let before = random_bytes();
        let key = store.put(&before).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), before);
    }
}
