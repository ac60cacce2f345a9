//! Metadata service: a versioned key-value store spoken over a small framed
//! TCP protocol, with server-side fan-out of accepted puts so every mount
//! learns about changes made by the others.

pub mod client;
pub mod remote;
pub mod server;

pub use client::{ClientOptions, MetaClient};
pub use remote::{ChangeListener, RemoteOptions, RemoteVersionedStore};
pub use server::{MetaServer, ServerOptions, TlsKeyPair};
