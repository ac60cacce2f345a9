//! Log-structured store: one append-only data file plus an in-memory key
//! directory. Records are `[key_len:u32][value_len:u32][key][value]`, the
//! directory maps each key to the offset and length of its newest value and
//! is rebuilt by scanning the log on open. Overwritten values stay in the
//! log until a future compaction pass; reads always go through the
//! directory, so they only ever see the latest record.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{Store, StoreError};

const DATA_FILE: &str = "slate.cask";

struct DirEntry {
    offset: u64,
    len: u32,
}

struct Inner {
    log: File,
    end: u64,
    keydir: HashMap<Vec<u8>, DirEntry>,
}

pub struct CaskStore {
    inner: Mutex<Inner>,
}

impl CaskStore {
    /// Open (or create) the database rooted at `dir`, scanning the log to
    /// rebuild the key directory. A torn final record is truncated away.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = Self::data_path(dir);
        let mut log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .await?;

        let (keydir, end) = Self::scan(&path).await?;
        if end < log.metadata().await?.len() {
            debug!(end, "truncating torn tail record");
            log.set_len(end).await?;
        }
        log.seek(SeekFrom::Start(end)).await?;

        Ok(Self {
            inner: Mutex::new(Inner { log, end, keydir }),
        })
    }

    fn data_path(dir: &Path) -> PathBuf {
        dir.join(DATA_FILE)
    }

    async fn scan(path: &Path) -> Result<(HashMap<Vec<u8>, DirEntry>, u64), StoreError> {
        let mut keydir = HashMap::new();
        let mut rd = BufReader::new(File::open(path).await?);
        let mut offset = 0u64;
        loop {
            let mut header = [0u8; 8];
            match rd.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let key_len = u32::from_be_bytes(header[..4].try_into().unwrap()) as usize;
            let value_len = u32::from_be_bytes(header[4..].try_into().unwrap());

            let mut key = vec![0u8; key_len];
            if rd.read_exact(&mut key).await.is_err() {
                break;
            }
            let value_offset = offset + 8 + key_len as u64;
            let mut skipped = vec![0u8; value_len as usize];
            if rd.read_exact(&mut skipped).await.is_err() {
                break;
            }
            keydir.insert(
                key,
                DirEntry {
                    offset: value_offset,
                    len: value_len,
                },
            );
            offset = value_offset + value_len as u64;
        }
        Ok((keydir, offset))
    }
}

#[async_trait]
impl Store for CaskStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let mut record = Vec::with_capacity(8 + key.len() + value.len());
        record.extend_from_slice(&(key.len() as u32).to_be_bytes());
        record.extend_from_slice(&(value.len() as u32).to_be_bytes());
        record.extend_from_slice(key);
        record.extend_from_slice(value);

        inner.log.write_all(&record).await?;
        inner.log.flush().await?;

        let value_offset = inner.end + 8 + key.len() as u64;
        inner.end += record.len() as u64;
        inner.keydir.insert(
            key.to_vec(),
            DirEntry {
                offset: value_offset,
                len: value.len() as u32,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.lock().await;
        let (offset, len) = match inner.keydir.get(key) {
            Some(entry) => (entry.offset, entry.len),
            None => return Err(StoreError::NotFound),
        };
        let mut value = vec![0u8; len as usize];
        inner.log.seek(SeekFrom::Start(offset)).await?;
        inner.log.read_exact(&mut value).await?;
        inner.log.seek(SeekFrom::End(0)).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CaskStore::open(tmp.path()).await.unwrap();
        store.put(b"song", b"peggy sue").await.unwrap();
        store.put(b"song", b"words of love").await.unwrap();
        store.put(b"other", b"").await.unwrap();
        assert_eq!(store.get(b"song").await.unwrap(), b"words of love");
        assert_eq!(store.get(b"other").await.unwrap(), b"");
        assert!(matches!(
            store.get(b"missing").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn reopen_rebuilds_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = CaskStore::open(tmp.path()).await.unwrap();
            store.put(b"a", b"1").await.unwrap();
            store.put(b"b", b"2").await.unwrap();
            store.put(b"a", b"3").await.unwrap();
        }
        let store = CaskStore::open(tmp.path()).await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap(), b"3");
        assert_eq!(store.get(b"b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn torn_tail_is_discarded_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = CaskStore::open(tmp.path()).await.unwrap();
            store.put(b"kept", b"value").await.unwrap();
        }
        // Append half a record.
        let path = tmp.path().join(DATA_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[0, 0, 0, 4, 0, 0]);
        std::fs::write(&path, raw).unwrap();

        let store = CaskStore::open(tmp.path()).await.unwrap();
        assert_eq!(store.get(b"kept").await.unwrap(), b"value");
        store.put(b"new", b"entry").await.unwrap();
        assert_eq!(store.get(b"new").await.unwrap(), b"entry");
    }
}
