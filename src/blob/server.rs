//! HTTP endpoint for blob storage.
//!
//! `GET /<hex>` returns the value (404 when absent), `PUT /<hex>` stores the
//! request body; any other method is a 400. Non-hex paths are a 400, backend
//! failures a 500.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::store::{Store, StoreError};

type SharedStore = Arc<dyn Store>;

pub fn blob_router(store: SharedStore) -> Router {
    Router::new()
        .route("/{key}", get(get_blob).put(put_blob).fallback(bad_request))
        .fallback(bad_request)
        .with_state(store)
}

/// Bind and serve until the task is cancelled.
pub async fn serve_blobs(bind: &str, store: SharedStore) -> Result<(), StoreError> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "blob server listening");
    axum::serve(listener, blob_router(store))
        .await
        .map_err(StoreError::from)
}

async fn get_blob(
    State(store): State<SharedStore>,
    Path(key): Path<String>,
) -> (StatusCode, Vec<u8>) {
    let raw = match hex::decode(&key) {
        Ok(raw) => raw,
        Err(_) => {
            warn!(%key, "bad request: expecting hex key only");
            return (
                StatusCode::BAD_REQUEST,
                format!("{key:?}: not a valid path, expecting hex key only").into_bytes(),
            );
        }
    };
    match store.get(&raw).await {
        Ok(value) => {
            debug!(op = "GET", %key, "success");
            (StatusCode::OK, value)
        }
        Err(StoreError::NotFound) => {
            debug!(op = "GET", %key, "not found");
            (StatusCode::NOT_FOUND, Vec::new())
        }
        Err(e) => {
            warn!(op = "GET", %key, err = %e, "backend failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{key:?}: {e}").into_bytes(),
            )
        }
    }
}

async fn put_blob(
    State(store): State<SharedStore>,
    Path(key): Path<String>,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    let raw = match hex::decode(&key) {
        Ok(raw) => raw,
        Err(_) => {
            warn!(%key, "bad request: expecting hex key only");
            return (
                StatusCode::BAD_REQUEST,
                format!("{key:?}: not a valid path, expecting hex key only").into_bytes(),
            );
        }
    };
    match store.put(&raw, &body).await {
        Ok(()) => {
            debug!(op = "PUT", %key, bytes = body.len(), "success");
            (StatusCode::OK, Vec::new())
        }
        Err(e) => {
            warn!(op = "PUT", %key, err = %e, "backend failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{key:?}: {e}").into_bytes(),
            )
        }
    }
}

async fn bad_request() -> (StatusCode, &'static str) {
    (
        StatusCode::BAD_REQUEST,
        "invalid request, expecting GET or PUT of /<hex-key>",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HttpStore, MemoryStore};

    async fn spawn_server() -> (String, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = blob_router(store.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        (format!("http://{addr}"), store)
    }

    #[tokio::test]
    async fn http_store_round_trip() {
        let (base, _store) = spawn_server().await;
        let remote = HttpStore::new(base);

        assert!(matches!(
            remote.get(&[0xaa]).await,
            Err(StoreError::NotFound)
        ));
        remote.put(&[0xaa, 0xbb], b"blob body").await.unwrap();
        assert_eq!(remote.get(&[0xaa, 0xbb]).await.unwrap(), b"blob body");
    }

    #[tokio::test]
    async fn non_hex_path_is_a_bad_request() {
        let (base, _store) = spawn_server().await;
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{base}/not-hex!"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let (base, _store) = spawn_server().await;
        let client = reqwest::Client::new();
        let response = client.post(format!("{base}/aabb")).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
