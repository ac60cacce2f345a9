//! Metadata server: accepts client connections (plain TCP or TLS), applies
//! GET/PUT messages to a versioned store, and fans accepted puts out to
//! every other authorized connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder, Message};
use crate::store::{StoreError, VersionedStore};

/// Paths to a PEM certificate chain and private key.
#[derive(Debug, Clone)]
pub struct TlsKeyPair {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Interface and port to bind, e.g. `127.0.0.1:8000`.
    pub bind: String,
    /// Serve TLS with this key pair instead of plain TCP.
    pub key_pair: Option<TlsKeyPair>,
    /// When set, connections must authenticate against this bcrypt hash
    /// before any other message. Requires a TLS key pair.
    pub auth_hash: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            key_pair: None,
            auth_hash: None,
        }
    }
}

trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}
type BoxedStream = Box<dyn Stream>;

struct ServerConn {
    id: u64,
    peer: SocketAddr,
    authorized: AtomicBool,
    writer: Mutex<WriteHalf<BoxedStream>>,
    encoder: Encoder,
}

impl ServerConn {
    async fn send(&self, m: &Message) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        self.encoder.encode(&mut *writer, m).await
    }
}

pub struct MetaServer {
    opts: ServerOptions,
    store: Arc<dyn VersionedStore>,
    listener: Mutex<Option<(TcpListener, Option<TlsAcceptor>)>>,
    conns: Mutex<HashMap<u64, Arc<ServerConn>>>,
    conn_ids: AtomicU64,
    /// Serializes put acceptance with its broadcast, so every connection
    /// observes broadcasts for one key in acceptance order.
    apply_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetaServer {
    pub fn new(store: Arc<dyn VersionedStore>, opts: ServerOptions) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            opts,
            store,
            listener: Mutex::new(None),
            conns: Mutex::new(HashMap::new()),
            conn_ids: AtomicU64::new(0),
            apply_lock: Mutex::new(()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Bind the listening socket and return the bound address. Fails with
    /// [`StoreError::PasswordWithoutTls`] when auth is configured on a
    /// plain-TCP server: a password must never travel in cleartext.
    pub async fn listen(&self) -> Result<SocketAddr, StoreError> {
        let acceptor = match &self.opts.key_pair {
            Some(pair) => Some(Self::tls_acceptor(pair)?),
            None => {
                if self.opts.auth_hash.is_some() {
                    return Err(StoreError::PasswordWithoutTls);
                }
                None
            }
        };
        let listener = TcpListener::bind(&self.opts.bind).await?;
        let addr = listener.local_addr()?;
        *self.listener.lock().await = Some((listener, acceptor));
        Ok(addr)
    }

    fn tls_acceptor(pair: &TlsKeyPair) -> Result<TlsAcceptor, StoreError> {
        let certs = CertificateDer::pem_file_iter(&pair.cert_path)
            .map_err(StoreError::other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::other)?;
        let key = PrivateKeyDer::from_pem_file(&pair.key_path).map_err(StoreError::other)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(StoreError::other)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Accept connections and spawn a handler per connection until
    /// [`MetaServer::shutdown`] is called.
    pub async fn serve(self: &Arc<Self>) -> Result<(), StoreError> {
        let (listener, acceptor) = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| StoreError::other("serve called before listen"))?;
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            let stream: BoxedStream = match &acceptor {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(tls) => Box::new(tls),
                    Err(e) => {
                        warn!(%peer, err = %e, "TLS handshake failed");
                        continue;
                    }
                },
                None => Box::new(socket),
            };
            let (reader, writer) = tokio::io::split(stream);
            let conn = Arc::new(ServerConn {
                id: self.conn_ids.fetch_add(1, Ordering::Relaxed) + 1,
                peer,
                // With no auth hash configured every connection starts
                // authorized.
                authorized: AtomicBool::new(self.opts.auth_hash.is_none()),
                writer: Mutex::new(writer),
                encoder: Encoder::new(),
            });
            info!(id = conn.id, remote = %peer, "client attached");
            self.conns.lock().await.insert(conn.id, conn.clone());
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_conn(conn, reader).await;
            });
        }
        Ok(())
    }

    /// Stop accepting and close every open connection. In-flight broadcasts
    /// may be dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let conns: Vec<_> = self.conns.lock().await.drain().map(|(_, c)| c).collect();
        for conn in conns {
            use tokio::io::AsyncWriteExt;
            let mut writer = conn.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }

    async fn handle_conn(self: &Arc<Self>, conn: Arc<ServerConn>, mut reader: ReadHalf<BoxedStream>) {
        let decoder = Decoder::new();
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let decoded = tokio::select! {
                decoded = decoder.decode(&mut reader) => decoded,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            let request = match decoded {
                Ok(m) => m,
                Err(StoreError::Underflow) => {
                    // Peer hung up.
                    break;
                }
                Err(e) => {
                    debug!(id = conn.id, err = %e, "dropping connection");
                    break;
                }
            };
            debug!(id = conn.id, msg = %request, "received");
            if !self.handle_message(&conn, request).await {
                break;
            }
        }
        self.conns.lock().await.remove(&conn.id);
        info!(id = conn.id, remote = %conn.peer, "client detached");
    }

    /// Apply one message and send the reply. Returns false when the
    /// connection must be closed (failed auth or a dead socket).
    async fn handle_message(self: &Arc<Self>, conn: &Arc<ServerConn>, request: Message) -> bool {
        if let Some(hash) = &self.opts.auth_hash {
            if !conn.authorized.load(Ordering::SeqCst) {
                return self.handle_auth(conn, hash, request).await;
            }
        }
        let reply = match request {
            Message::Get { tag, key } => match self.store.get(&key).await {
                Ok((version, value)) => Message::put(tag, key, value, version),
                Err(e) => Message::error(tag, e.to_string()),
            },
            Message::Put {
                tag,
                key,
                value,
                version,
            } => {
                // Acceptance and fan-out happen under one lock so receivers
                // observe broadcasts for a key in acceptance order.
                let guard = self.apply_lock.lock().await;
                match self.store.put(version, &key, &value).await {
                    Ok(()) => {
                        debug!(key = %hex::encode(&key[..key.len().min(5)]), version, "applied put");
                        let echo = Message::put(tag, key, value, version);
                        if let Some(broadcast) = echo.for_broadcast() {
                            self.broadcast(conn.id, &broadcast).await;
                        }
                        drop(guard);
                        echo
                    }
                    Err(e) => Message::error(tag, e.to_string()),
                }
            }
            other @ (Message::Auth { .. } | Message::Error { .. }) => Message::error(
                other.tag(),
                format!("messages of kind {} cannot be applied", other.kind_name()),
            ),
        };
        if let Err(e) = conn.send(&reply).await {
            warn!(id = conn.id, err = %e, "could not reply");
            return false;
        }
        true
    }

    async fn handle_auth(&self, conn: &Arc<ServerConn>, hash: &str, request: Message) -> bool {
        match request {
            Message::Auth { tag, password } => {
                if bcrypt::verify(&password, hash).unwrap_or(false) {
                    conn.authorized.store(true, Ordering::SeqCst);
                    info!(id = conn.id, "client authorized");
                    conn.send(&Message::auth(tag, "")).await.is_ok()
                } else {
                    warn!(id = conn.id, "wrong password");
                    let _ = conn.send(&Message::error(tag, "wrong password")).await;
                    false
                }
            }
            other => {
                let _ = conn
                    .send(&Message::error(other.tag(), "unauthorized"))
                    .await;
                true
            }
        }
    }

    /// Best-effort fan-out to every other authorized connection. A failed
    /// write only costs that client freshness: it will see stale content
    /// and send stale puts until it reloads.
    async fn broadcast(&self, sender: u64, broadcast: &Message) {
        let conns: Vec<_> = self.conns.lock().await.values().cloned().collect();
        for conn in conns {
            if conn.id == sender || !conn.authorized.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = conn.send(broadcast).await {
                warn!(msg = %broadcast, recipient = conn.id, err = %e, "could not notify");
            } else {
                debug!(msg = %broadcast, recipient = conn.id, "notified");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, VersionedWrapper};

    fn in_memory_server(opts: ServerOptions) -> Arc<MetaServer> {
        let store = Arc::new(VersionedWrapper::new(Arc::new(MemoryStore::new())));
        MetaServer::new(store, opts)
    }

    #[tokio::test]
    async fn password_without_tls_is_rejected() {
        let server = in_memory_server(ServerOptions {
            bind: "127.0.0.1:0".into(),
            key_pair: None,
            auth_hash: Some("anything".into()),
        });
        assert!(matches!(
            server.listen().await,
            Err(StoreError::PasswordWithoutTls)
        ));
    }

    #[tokio::test]
    async fn can_be_shut_down_right_after_start() {
        let server = in_memory_server(ServerOptions {
            bind: "127.0.0.1:0".into(),
            ..Default::default()
        });
        server.listen().await.unwrap();
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        server.shutdown().await;
        serving.await.unwrap().unwrap();
    }
}
