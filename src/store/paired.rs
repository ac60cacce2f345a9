//! Two-tier store: a fast local cache written synchronously and a slow
//! remote tier written back asynchronously by a single worker.
//!
//! Consistency contract: a successful put is visible to local gets
//! immediately and to remote observers eventually. If the process exits
//! before the queue drains the write is lost, which is acceptable for
//! content-addressed blobs that any client can recompute and re-put.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{Store, StoreError};

const WRITE_BACK_QUEUE: usize = 32;
const RETRY_BASE: Duration = Duration::from_secs(1);

pub struct PairedStore {
    fast: Arc<dyn Store>,
    slow: Arc<dyn Store>,
    write_back: mpsc::Sender<(Vec<u8>, Vec<u8>)>,
}

impl PairedStore {
    /// Pair `fast` with `slow` and spawn the write-back worker. The worker
    /// retries each slow put until it succeeds, sleeping at least
    /// [`RETRY_BASE`] (jittered) between attempts, and exits when the
    /// paired store is dropped.
    pub fn new(fast: Arc<dyn Store>, slow: Arc<dyn Store>) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_BACK_QUEUE);
        tokio::spawn(write_back(slow.clone(), rx));
        Self {
            fast,
            slow,
            write_back: tx,
        }
    }
}

#[async_trait]
impl Store for PairedStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.fast.put(key, value).await?;
        // Never blocks on the slow side beyond queue capacity.
        self.write_back
            .send((key.to_vec(), value.to_vec()))
            .await
            .map_err(|_| StoreError::other("write-back worker gone"))?;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        match self.fast.get(key).await {
            Ok(value) => return Ok(value),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let value = self.slow.get(key).await?;
        // Populate the fast tier for next time; a failure here only costs
        // a future slow read.
        if let Err(e) = self.fast.put(key, &value).await {
            warn!(key = %hex_prefix(key), err = %e, "could not propagate from slow to fast");
        } else {
            debug!(key = %hex_prefix(key), "propagated from slow to fast");
        }
        Ok(value)
    }
}

async fn write_back(slow: Arc<dyn Store>, mut rx: mpsc::Receiver<(Vec<u8>, Vec<u8>)>) {
    while let Some((key, value)) = rx.recv().await {
        loop {
            match slow.put(&key, &value).await {
                Ok(()) => {
                    debug!(key = %hex_prefix(&key), "propagated from fast to slow");
                    break;
                }
                Err(e) => {
                    warn!(key = %hex_prefix(&key), err = %e, "could not propagate from fast to slow");
                    let jitter = rand::rng().next_u64() % 250;
                    tokio::time::sleep(RETRY_BASE + Duration::from_millis(jitter)).await;
                }
            }
        }
    }
}

fn hex_prefix(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(5)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to a memory store but fails every call while tripped.
    #[derive(Default)]
    struct Breakable {
        broken: AtomicBool,
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for Breakable {
        async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::other("tripped"));
            }
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::other("tripped"));
            }
            self.inner.get(key).await
        }
    }

    #[tokio::test]
    async fn put_is_immediately_visible_locally_and_eventually_remotely() {
        let fast = Arc::new(MemoryStore::new());
        let slow = Arc::new(MemoryStore::new());
        let paired = PairedStore::new(fast.clone(), slow.clone());

        paired.put(b"k", b"v").await.unwrap();
        assert_eq!(paired.get(b"k").await.unwrap(), b"v");
        assert_eq!(fast.get(b"k").await.unwrap(), b"v");

        for _ in 0..100 {
            if slow.get(b"k").await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("write-back never reached the slow store");
    }

    #[tokio::test]
    async fn get_falls_through_and_repopulates_fast() {
        let fast = Arc::new(MemoryStore::new());
        let slow = Arc::new(MemoryStore::new());
        slow.put(b"cold", b"data").await.unwrap();

        let paired = PairedStore::new(fast.clone(), slow);
        assert_eq!(paired.get(b"cold").await.unwrap(), b"data");
        assert_eq!(fast.get(b"cold").await.unwrap(), b"data");
    }

    #[tokio::test(start_paused = true)]
    async fn write_back_retries_until_the_slow_store_recovers() {
        let fast = Arc::new(MemoryStore::new());
        let slow = Arc::new(Breakable::default());
        slow.broken.store(true, Ordering::SeqCst);

        let paired = PairedStore::new(fast, slow.clone());
        paired.put(b"k", b"v").await.unwrap();

        // Let a few failed attempts elapse, then heal the slow store.
        tokio::time::sleep(Duration::from_secs(3)).await;
        slow.broken.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(slow.inner.get(b"k").await.unwrap(), b"v");
    }
}
