//! Low-level metadata client: one lazily-dialed connection carrying tagged
//! requests, a background reader that demultiplexes responses, and a channel
//! of tag-0 broadcast messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::codec::{Decoder, Encoder, Message, TagAllocator};
use crate::store::StoreError;

const BROADCAST_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `tls://host:port`, `tcp://host:port`, or a bare `host:port` (TCP).
    pub address: String,
    /// Retry a failed TLS dial over plain TCP.
    pub fallback_to_plain_tcp: bool,
    /// PEM bundle of roots to trust for `tls://` addresses. Without it a
    /// TLS dial can only succeed via the plain-TCP fallback.
    pub tls_ca_path: Option<String>,
    /// Password for the server's auth handshake, sent right after dialing.
    pub password: Option<String>,
    /// Deadline for writing one request to the socket.
    pub write_timeout: Duration,
    /// Deadline for the matching response to arrive.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            address: "tcp://127.0.0.1:8000".to_string(),
            fallback_to_plain_tcp: false,
            tls_ca_path: None,
            password: None,
            write_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}
type BoxedStream = Box<dyn Stream>;

struct ConnState {
    writer: WriteHalf<BoxedStream>,
    generation: u64,
}

type PendingSlot = oneshot::Sender<Result<Message, StoreError>>;

pub struct MetaClient {
    opts: ClientOptions,
    conn: Mutex<Option<ConnState>>,
    generations: AtomicU64,
    pending: Arc<DashMap<u16, PendingSlot>>,
    tags: TagAllocator,
    encoder: Encoder,
    broadcast_tx: mpsc::Sender<Message>,
    broadcast_rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl MetaClient {
    pub fn new(opts: ClientOptions) -> Arc<Self> {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);
        Arc::new(Self {
            opts,
            conn: Mutex::new(None),
            generations: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            tags: TagAllocator::new(),
            encoder: Encoder::new(),
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
        })
    }

    /// Take the stream of tag-0 broadcast messages. Can be taken once;
    /// while nobody drains the channel, broadcasts are dropped as soon as
    /// the buffer fills.
    pub async fn broadcasts(&self) -> Option<mpsc::Receiver<Message>> {
        self.broadcast_rx.lock().await.take()
    }

    /// Send a tagged request and await the response carrying the same tag.
    /// `make` receives the allocated tag. Times out per the client options;
    /// a response arriving after the timeout is dropped on the floor.
    pub async fn request(
        self: &Arc<Self>,
        make: impl FnOnce(u16) -> Message,
    ) -> Result<Message, StoreError> {
        self.ensure_connected().await?;
        let tag = self.tags.next();
        let request = make(tag);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag, tx);

        if let Err(e) = self.write_request(&request).await {
            self.pending.remove(&tag);
            self.close().await;
            return Err(e);
        }

        match tokio::time::timeout(self.opts.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::other("connection closed")),
            Err(_) => {
                self.pending.remove(&tag);
                Err(StoreError::Timeout)
            }
        }
    }

    /// Close the connection. Outstanding requests fail; the next request
    /// redials.
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(state) = conn.take() {
            use tokio::io::AsyncWriteExt;
            let mut writer = state.writer;
            let _ = writer.shutdown().await;
        }
        fail_pending(&self.pending);
    }

    async fn write_request(&self, request: &Message) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let state = conn
            .as_mut()
            .ok_or_else(|| StoreError::other("not connected"))?;
        match tokio::time::timeout(
            self.opts.write_timeout,
            self.encoder.encode(&mut state.writer, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<(), StoreError> {
        if self.conn.lock().await.is_some() {
            return Ok(());
        }
        self.dial().await?;
        if let Some(password) = self.opts.password.clone() {
            self.handshake(password).await?;
        }
        Ok(())
    }

    async fn dial(self: &Arc<Self>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        if conn.is_some() {
            // Raced with another caller; theirs won.
            return Ok(());
        }
        let stream = self.connect_stream().await?;
        let (reader, writer) = tokio::io::split(stream);
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *conn = Some(ConnState { writer, generation });
        drop(conn);

        let client = self.clone();
        tokio::spawn(async move {
            client.read_loop(reader, generation).await;
        });
        Ok(())
    }

    async fn connect_stream(&self) -> Result<BoxedStream, StoreError> {
        let address = self.opts.address.as_str();
        if let Some(host_port) = address.strip_prefix("tls://") {
            match self.dial_tls(host_port).await {
                Ok(stream) => return Ok(stream),
                Err(e) if self.opts.fallback_to_plain_tcp => {
                    warn!(err = %e, "could not dial using TLS, trying plain TCP");
                }
                Err(e) => return Err(e),
            }
            let tcp = TcpStream::connect(host_port).await?;
            return Ok(Box::new(tcp));
        }
        let host_port = address.strip_prefix("tcp://").unwrap_or(address);
        let tcp = TcpStream::connect(host_port).await?;
        Ok(Box::new(tcp))
    }

    async fn dial_tls(&self, host_port: &str) -> Result<BoxedStream, StoreError> {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca_path) = &self.opts.tls_ca_path {
            for cert in CertificateDer::pem_file_iter(ca_path).map_err(StoreError::other)? {
                roots
                    .add(cert.map_err(StoreError::other)?)
                    .map_err(StoreError::other)?;
            }
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let host = host_port.rsplit_once(':').map(|(h, _)| h).unwrap_or(host_port);
        let server_name = ServerName::try_from(host.to_string()).map_err(StoreError::other)?;
        let tcp = TcpStream::connect(host_port).await?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(StoreError::other)?;
        Ok(Box::new(tls))
    }

    async fn handshake(self: &Arc<Self>, password: String) -> Result<(), StoreError> {
        match self.raw_auth(password).await {
            Ok(Message::Auth { .. }) => Ok(()),
            Ok(Message::Error { text, .. }) => {
                self.close().await;
                Err(StoreError::Auth(text))
            }
            Ok(other) => {
                self.close().await;
                Err(StoreError::BadMessage(format!(
                    "unexpected {} reply to auth",
                    other.kind_name()
                )))
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn raw_auth(self: &Arc<Self>, password: String) -> Result<Message, StoreError> {
        let tag = self.tags.next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag, tx);
        if let Err(e) = self.write_request(&Message::auth(tag, password)).await {
            self.pending.remove(&tag);
            return Err(e);
        }
        match tokio::time::timeout(self.opts.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::other("connection closed")),
            Err(_) => {
                self.pending.remove(&tag);
                Err(StoreError::Timeout)
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<BoxedStream>, generation: u64) {
        let decoder = Decoder::new();
        loop {
            match decoder.decode(&mut reader).await {
                Ok(message) => {
                    if message.tag() == 0 {
                        // Broadcast; never block the reader on listener work.
                        if self.broadcast_tx.try_send(message).is_err() {
                            debug!("broadcast buffer full, dropping");
                        }
                        continue;
                    }
                    match self.pending.remove(&message.tag()) {
                        Some((_, slot)) => {
                            let _ = slot.send(Ok(message));
                        }
                        None => {
                            // Response to a request that already timed out.
                            debug!(tag = message.tag(), "dropping unexpected response");
                        }
                    }
                }
                Err(e) => {
                    debug!(err = %e, "reader stopping");
                    break;
                }
            }
        }
        // Only tear down the connection this reader belongs to; a redial may
        // already have installed a fresh one.
        let mut conn = self.conn.lock().await;
        if conn
            .as_ref()
            .map(|state| state.generation == generation)
            .unwrap_or(false)
        {
            *conn = None;
        }
        drop(conn);
        fail_pending(&self.pending);
    }
}

fn fail_pending(pending: &DashMap<u16, PendingSlot>) {
    let tags: Vec<u16> = pending.iter().map(|entry| *entry.key()).collect();
    for tag in tags {
        if let Some((_, slot)) = pending.remove(&tag) {
            let _ = slot.send(Err(StoreError::other("connection closed")));
        }
    }
}
