//! `VersionedStore` implementation backed by a metadata server, with a
//! local cache kept warm by server broadcasts.
//!
//! Every successful get and put lands in the cache, and each tag-0 broadcast
//! updates it (strictly newer versions only) before being handed to the
//! registered change listener. Gets are served from the cache first, so a
//! client that has seen a broadcast can answer without another round trip.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::Message;
use crate::meta::client::MetaClient;
use crate::store::{StoreError, VersionedStore};

/// Invoked with every broadcast received by the client, after the local
/// cache has been updated. Handlers run on a dedicated dispatch task, never
/// on the connection reader, so they may take their time (and locks).
pub type ChangeListener = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Default)]
pub struct RemoteOptions {
    pub change_listener: Option<ChangeListener>,
}

pub struct RemoteVersionedStore {
    client: Arc<MetaClient>,
    cache: Arc<Mutex<HashMap<Vec<u8>, (u64, Vec<u8>)>>>,
    listener: Arc<std::sync::Mutex<Option<ChangeListener>>>,
}

impl RemoteVersionedStore {
    pub fn new(client: Arc<MetaClient>, opts: RemoteOptions) -> Arc<Self> {
        let store = Arc::new(Self {
            client: client.clone(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            listener: Arc::new(std::sync::Mutex::new(opts.change_listener)),
        });
        store.clone().start();
        store
    }

    /// Install (or replace) the change listener. Broadcasts seen before a
    /// listener exists still update the cache; only the notification is
    /// skipped. This late binding exists because the usual listener (the
    /// node engine) is itself constructed around this store.
    pub fn set_change_listener(&self, listener: ChangeListener) {
        *self.listener.lock().expect("listener lock poisoned") = Some(listener);
    }

    /// Spawn the broadcast dispatch task: cache update first, then the
    /// listener.
    fn start(self: Arc<Self>) {
        let client = self.client.clone();
        let store = self;
        tokio::spawn(async move {
            let Some(mut rx) = client.broadcasts().await else {
                warn!("broadcast stream already taken");
                return;
            };
            while let Some(message) = rx.recv().await {
                if let Message::Put {
                    ref key,
                    ref value,
                    version,
                    ..
                } = message
                {
                    store.remember(key, version, value).await;
                } else {
                    debug!(msg = %message, "ignoring non-put broadcast");
                    continue;
                }
                let listener = store
                    .listener
                    .lock()
                    .expect("listener lock poisoned")
                    .clone();
                if let Some(listener) = listener {
                    listener(message);
                }
            }
        });
    }

    /// Keep the newest version seen for a key; older broadcasts and replies
    /// must never clobber a fresher cache entry.
    async fn remember(&self, key: &[u8], version: u64, value: &[u8]) {
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(&(cached, _)) if cached >= version => {}
            _ => {
                cache.insert(key.to_vec(), (version, value.to_vec()));
            }
        }
    }
}

#[async_trait]
impl VersionedStore for RemoteVersionedStore {
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let key_owned = key.to_vec();
        let value_owned = value.to_vec();
        let reply = self
            .client
            .request(move |tag| Message::put(tag, key_owned, value_owned, version))
            .await?;
        match reply {
            Message::Put { .. } => {
                self.remember(key, version, value).await;
                Ok(())
            }
            Message::Error { text, .. } => {
                let err = error_from_text(text);
                if matches!(err, StoreError::StalePut) {
                    // Someone else won this version; whatever we have cached
                    // is behind, and the next get must ask the server.
                    self.cache.lock().await.remove(key);
                }
                Err(err)
            }
            other => Err(StoreError::BadMessage(format!(
                "unexpected {} reply to put",
                other.kind_name()
            ))),
        }
    }

    async fn get(&self, key: &[u8]) -> Result<(u64, Vec<u8>), StoreError> {
        if let Some((version, value)) = self.cache.lock().await.get(key).cloned() {
            return Ok((version, value));
        }
        let key_owned = key.to_vec();
        let reply = self
            .client
            .request(move |tag| Message::get(tag, key_owned))
            .await?;
        match reply {
            Message::Put { value, version, .. } => {
                self.remember(key, version, &value).await;
                Ok((version, value.to_vec()))
            }
            Message::Error { text, .. } => Err(error_from_text(text)),
            other => Err(StoreError::BadMessage(format!(
                "unexpected {} reply to get",
                other.kind_name()
            ))),
        }
    }
}

/// The wire carries error text, not codes; map the two errors with protocol
/// meaning back to their variants so callers can match on them.
fn error_from_text(text: String) -> StoreError {
    match text.as_str() {
        "not found" => StoreError::NotFound,
        "stale put" => StoreError::StalePut,
        _ => StoreError::Other(text),
    }
}
