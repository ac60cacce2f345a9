//! Blob service: a thin HTTP face over a raw store. Content addressing
//! happens on the client side, so the service itself is just byte storage
//! keyed by the hex-encoded path.

pub mod server;

pub use server::{blob_router, serve_blobs};
