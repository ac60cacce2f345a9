use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use slatefs::fuse::mount::mount_unprivileged;
use slatefs::fuse::SlateFs;
use slatefs::meta::{ClientOptions, MetaClient, MetaServer, RemoteOptions, ServerOptions, TlsKeyPair};
use slatefs::node::NodeEngine;
use slatefs::store::{
    open_store, BlobStore, DiskStore, HttpStore, PairedStore, VersionedWrapper,
};
use slatefs::RemoteVersionedStore;

#[derive(Parser)]
#[command(name = "slatefs", version, about = "SlateFS distributed filesystem")]
struct Cli {
    /// Enable debug logging.
    #[arg(short = 'D', long, global = true, env = "SLATEFS_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a metadata server.
    Meta(MetaArgs),
    /// Start a blob server.
    Blob(BlobArgs),
    /// Mount a SlateFS filesystem.
    Mount(MountArgs),
}

#[derive(Args)]
struct MetaArgs {
    /// Interface and port to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8000", env = "SLATEFS_META_BIND")]
    bind: String,

    /// Store used for metadata (`memory://`, `disk://<dir>`, `cask://<dir>`).
    #[arg(short, long, default_value = "cask://slatefs.db", env = "SLATEFS_STORE")]
    store: String,

    /// PEM certificate chain; serve TLS when set (together with --key).
    #[arg(long, requires = "key", env = "SLATEFS_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, requires = "cert", env = "SLATEFS_KEY")]
    key: Option<PathBuf>,

    /// bcrypt hash clients must match before speaking; requires TLS.
    #[arg(long, env = "SLATEFS_AUTH_HASH")]
    auth_hash: Option<String>,
}

#[derive(Args)]
struct BlobArgs {
    /// Interface and port to listen on.
    #[arg(short, long, default_value = "127.0.0.1:9000", env = "SLATEFS_BLOB_BIND")]
    bind: String,

    /// Directory used to store blob data.
    #[arg(short, long, default_value = "./data", env = "SLATEFS_DATA")]
    data: PathBuf,
}

#[derive(Args)]
struct MountArgs {
    /// Metadata server address (`tcp://host:port` or `tls://host:port`).
    #[arg(value_name = "METADATA_SERVER")]
    metadata_server: String,

    /// Blob server URL, e.g. `http://host:9000`.
    #[arg(value_name = "BLOB_SERVER")]
    blob_server: String,

    /// Directory to mount the filesystem on.
    #[arg(value_name = "MOUNT_POINT")]
    mount_point: PathBuf,

    /// Directory used to cache blobs locally.
    #[arg(short, long, default_value = "./cache", env = "SLATEFS_CACHE")]
    cache: PathBuf,

    /// Password for the metadata server's auth handshake.
    #[arg(long, env = "SLATEFS_PASSWORD")]
    password: Option<String>,

    /// PEM bundle of roots to trust for `tls://` metadata addresses.
    #[arg(long, env = "SLATEFS_TLS_CA")]
    tls_ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.debug { "slatefs=debug" } else { "slatefs=info" };
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string()))
        .init();

    match cli.cmd {
        Command::Meta(args) => meta_cmd(args).await,
        Command::Blob(args) => blob_cmd(args).await,
        Command::Mount(args) => mount_cmd(args).await,
    }
}

async fn meta_cmd(args: MetaArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store).await?;
    let versioned = Arc::new(VersionedWrapper::new(store));

    let key_pair = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(TlsKeyPair {
            cert_path: cert.display().to_string(),
            key_path: key.display().to_string(),
        }),
        _ => None,
    };
    let server = MetaServer::new(
        versioned,
        ServerOptions {
            bind: args.bind,
            key_pair,
            auth_hash: args.auth_hash,
        },
    );
    let addr = server.listen().await?;
    info!(%addr, store = %args.store, "metadata server listening");

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };
    tokio::signal::ctrl_c().await?;
    info!("shutting down metadata server");
    server.shutdown().await;
    serving.await??;
    Ok(())
}

async fn blob_cmd(args: BlobArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.data)?;
    let store = Arc::new(DiskStore::new(&args.data));
    info!(data = %args.data.display(), "using disk store");

    tokio::select! {
        served = slatefs::blob::serve_blobs(&args.bind, store) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutting down blob server"),
    }
    Ok(())
}

async fn mount_cmd(args: MountArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.mount_point)?;
    std::fs::create_dir_all(&args.cache)?;

    let client = MetaClient::new(ClientOptions {
        address: args.metadata_server.clone(),
        fallback_to_plain_tcp: true,
        tls_ca_path: args.tls_ca.map(|p| p.display().to_string()),
        password: args.password,
        ..Default::default()
    });

    let cache = Arc::new(DiskStore::new(&args.cache));
    let remote_blobs = Arc::new(HttpStore::new(args.blob_server.clone()));
    let blobs = Arc::new(BlobStore::new(Arc::new(PairedStore::new(
        cache,
        remote_blobs,
    ))));

    // The engine consumes the metadata store and also receives its change
    // broadcasts, so the listener is wired in after construction.
    let metadata = RemoteVersionedStore::new(client, RemoteOptions::default());
    let engine = NodeEngine::new(metadata.clone(), blobs);
    metadata.set_change_listener(engine.change_listener());
    engine.init_root().await?;

    let handle = mount_unprivileged(SlateFs::new(engine), &args.mount_point).await?;
    info!(mount = %args.mount_point.display(), "mounted");

    tokio::signal::ctrl_c().await?;
    info!("unmounting");
    if let Err(e) = handle.unmount().await {
        warn!(err = %e, "could not unmount filesystem");
    }
    Ok(())
}
