//! End-to-end tests for the metadata service: a real server on an
//! ephemeral port, real clients, broadcasts included.

use std::sync::Arc;
use std::time::Duration;

use slatefs::meta::{ClientOptions, MetaClient, MetaServer, RemoteOptions, ServerOptions, TlsKeyPair};
use slatefs::{Message, RemoteVersionedStore, StoreError, VersionedStore, VersionedWrapper};
use slatefs::MemoryStore;
use tokio::sync::mpsc;

struct Disposable {
    server: Arc<MetaServer>,
    addr: String,
    serving: tokio::task::JoinHandle<Result<(), StoreError>>,
}

impl Disposable {
    async fn start() -> Self {
        Self::start_with(ServerOptions {
            bind: "127.0.0.1:0".into(),
            ..Default::default()
        })
        .await
    }

    async fn start_with(opts: ServerOptions) -> Self {
        let store = Arc::new(VersionedWrapper::new(Arc::new(MemoryStore::new())));
        let server = MetaServer::new(store, opts);
        let addr = server.listen().await.expect("listen");
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };
        Self {
            server,
            addr: addr.to_string(),
            serving,
        }
    }

    async fn stop(self) {
        self.server.shutdown().await;
        self.serving.await.expect("join").expect("serve");
    }
}

fn attached_client(addr: &str) -> Arc<MetaClient> {
    MetaClient::new(ClientOptions {
        address: format!("tcp://{addr}"),
        ..Default::default()
    })
}

/// Remote store plus a channel of the broadcasts its client received.
fn remote_store(addr: &str) -> (Arc<RemoteVersionedStore>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let store = RemoteVersionedStore::new(
        attached_client(addr),
        RemoteOptions {
            change_listener: Some(Arc::new(move |m| {
                let _ = tx.send(m);
            })),
        },
    );
    (store, rx)
}

#[tokio::test]
async fn can_be_shut_down_right_after_start() {
    let server = Disposable::start().await;
    server.stop().await;
}

#[tokio::test]
async fn error_messages_cannot_be_applied() {
    let server = Disposable::start().await;
    let client = attached_client(&server.addr);
    let reply = client
        .request(|tag| Message::error(tag, "test error"))
        .await
        .expect("request");
    match reply {
        Message::Error { text, .. } => {
            assert_eq!(text, "messages of kind ERROR cannot be applied");
        }
        other => panic!("unexpected reply: {other}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn auth_messages_cannot_be_applied_without_auth_config() {
    let server = Disposable::start().await;
    let client = attached_client(&server.addr);
    let reply = client
        .request(|tag| Message::auth(tag, "password"))
        .await
        .expect("request");
    match reply {
        Message::Error { text, .. } => {
            assert_eq!(text, "messages of kind AUTH cannot be applied");
        }
        other => panic!("unexpected reply: {other}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn conflicting_puts_have_exactly_one_winner() {
    let server = Disposable::start().await;
    let (client1, _rx1) = remote_store(&server.addr);
    let (client2, _rx2) = remote_store(&server.addr);

    let err1 = client1.put(1, b"name", b"Alberto").await.err();
    let err2 = client2.put(1, b"name", b"Leonardo").await.err();

    let winner: &[u8] = match (&err1, &err2) {
        (Some(StoreError::StalePut), None) => b"Leonardo",
        (None, Some(StoreError::StalePut)) => b"Alberto",
        other => panic!("expected exactly one stale put, got {other:?}"),
    };

    let (version1, value1) = client1.get(b"name").await.expect("get 1");
    let (version2, value2) = client2.get(b"name").await.expect("get 2");
    assert_eq!(version1, 1);
    assert_eq!(version2, 1);
    assert_eq!(value1, winner);
    assert_eq!(value2, winner);
    server.stop().await;
}

#[tokio::test]
async fn one_client_puts_another_one_gets() {
    let server = Disposable::start().await;

    let (writer, _rx) = remote_store(&server.addr);
    writer.put(1, b"username", b"glenda").await.expect("put");

    let (reader, _rx) = remote_store(&server.addr);
    let (version, value) = reader.get(b"username").await.expect("get");
    assert_eq!(version, 1);
    assert_eq!(value, b"glenda");
    server.stop().await;
}

#[tokio::test]
async fn successful_put_fans_out_to_other_clients() {
    let server = Disposable::start().await;

    let (writer, _rx1) = remote_store(&server.addr);
    let (observer2, mut rx2) = remote_store(&server.addr);
    let (observer3, mut rx3) = remote_store(&server.addr);

    // Dial the observers in so the server has someone to notify.
    assert!(matches!(
        observer2.get(b"warmup").await,
        Err(StoreError::NotFound)
    ));
    assert!(matches!(
        observer3.get(b"warmup").await,
        Err(StoreError::NotFound)
    ));

    writer.put(444, b"foo", b"bar").await.expect("put");

    let seen2 = tokio::time::timeout(Duration::from_secs(5), rx2.recv())
        .await
        .expect("observer 2 broadcast")
        .expect("channel open");
    let seen3 = tokio::time::timeout(Duration::from_secs(5), rx3.recv())
        .await
        .expect("observer 3 broadcast")
        .expect("channel open");
    for seen in [seen2, seen3] {
        match seen {
            Message::Put {
                tag,
                key,
                value,
                version,
            } => {
                assert_eq!(tag, 0);
                assert_eq!(&key[..], b"foo");
                assert_eq!(&value[..], b"bar");
                assert_eq!(version, 444);
            }
            other => panic!("unexpected broadcast: {other}"),
        }
    }

    // Shut the server down first: the observers must answer from their
    // local caches.
    server.stop().await;

    let (version, value) = observer2.get(b"foo").await.expect("local get 2");
    assert_eq!((version, value.as_slice()), (444, &b"bar"[..]));
    let (version, value) = observer3.get(b"foo").await.expect("local get 3");
    assert_eq!((version, value.as_slice()), (444, &b"bar"[..]));
}

#[tokio::test]
async fn broadcast_to_closed_connection_does_not_break_the_put() {
    let server = Disposable::start().await;

    let client1 = attached_client(&server.addr);
    let client2 = attached_client(&server.addr);

    // Attach client2 then close it, so the server holds a dead connection.
    let _ = client2.request(|tag| Message::get(tag, &b"x"[..])).await;
    client2.close().await;

    let reply = client1
        .request(|tag| Message::put(tag, &b"genre"[..], &b"jazz"[..], 1))
        .await
        .expect("put");
    match reply {
        Message::Put {
            key, value, version, ..
        } => {
            assert_eq!(&key[..], b"genre");
            assert_eq!(&value[..], b"jazz");
            assert_eq!(version, 1);
        }
        other => panic!("unexpected reply: {other}"),
    }
    server.stop().await;
}

#[tokio::test]
async fn request_without_server_times_out_or_fails() {
    // Nothing listens here; dialing fails outright.
    let client = MetaClient::new(ClientOptions {
        address: "tcp://127.0.0.1:1".into(),
        request_timeout: Duration::from_millis(200),
        ..Default::default()
    });
    let err = client
        .request(|tag| Message::get(tag, &b"k"[..]))
        .await
        .expect_err("no server");
    assert!(!matches!(err, StoreError::NotFound), "got {err}");
}

mod tls {
    use super::*;

    fn write_key_pair(dir: &std::path::Path) -> TlsKeyPair {
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("cert");
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).expect("write cert");
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).expect("write key");
        TlsKeyPair {
            cert_path: cert_path.display().to_string(),
            key_path: key_path.display().to_string(),
        }
    }

    #[tokio::test]
    async fn password_without_tls_is_rejected_at_listen() {
        let store = Arc::new(VersionedWrapper::new(Arc::new(MemoryStore::new())));
        let server = MetaServer::new(
            store,
            ServerOptions {
                bind: "127.0.0.1:0".into(),
                key_pair: None,
                auth_hash: Some("anything".into()),
            },
        );
        assert!(matches!(
            server.listen().await,
            Err(StoreError::PasswordWithoutTls)
        ));
    }

    #[tokio::test]
    async fn auth_handshake_over_tls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_pair = write_key_pair(dir.path());
        let hash = bcrypt::hash("s3cr3t", 4).expect("hash");

        let server = Disposable::start_with(ServerOptions {
            bind: "127.0.0.1:0".into(),
            key_pair: Some(key_pair.clone()),
            auth_hash: Some(hash),
        })
        .await;

        // Correct password: requests work.
        let client = MetaClient::new(ClientOptions {
            address: format!("tls://localhost:{}", server.addr.rsplit(':').next().unwrap()),
            tls_ca_path: Some(key_pair.cert_path.clone()),
            password: Some("s3cr3t".into()),
            ..Default::default()
        });
        let reply = client
            .request(|tag| Message::put(tag, &b"k"[..], &b"v"[..], 1))
            .await
            .expect("authorized put");
        assert!(matches!(reply, Message::Put { .. }));

        // Wrong password: the handshake fails.
        let intruder = MetaClient::new(ClientOptions {
            address: format!("tls://localhost:{}", server.addr.rsplit(':').next().unwrap()),
            tls_ca_path: Some(key_pair.cert_path),
            password: Some("guess".into()),
            ..Default::default()
        });
        let err = intruder
            .request(|tag| Message::get(tag, &b"k"[..]))
            .await
            .expect_err("wrong password");
        assert!(matches!(err, StoreError::Auth(_)), "got {err}");

        server.stop().await;
    }
}
