//! Raw store backed by the blob service HTTP endpoint. The key travels
//! hex-encoded in the URL path; bodies are the raw value bytes.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::store::{Store, StoreError};

pub struct HttpStore {
    base: String,
    client: reqwest::Client,
}

impl HttpStore {
    /// `base` is the blob service root, e.g. `http://127.0.0.1:9000`.
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self {
            base,
            client: reqwest::Client::new(),
        }
    }

    fn url_for(&self, key: &[u8]) -> String {
        format!("{}/{}", self.base, hex::encode(key))
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url_for(key))
            .body(value.to_vec())
            .send()
            .await
            .map_err(StoreError::other)?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(StoreError::other(format!("blob put failed: {status}"))),
        }
    }

    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get(self.url_for(key))
            .send()
            .await
            .map_err(StoreError::other)?;
        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await.map_err(StoreError::other)?;
                Ok(body.to_vec())
            }
            StatusCode::NOT_FOUND => Err(StoreError::NotFound),
            status => Err(StoreError::other(format!("blob get failed: {status}"))),
        }
    }
}
