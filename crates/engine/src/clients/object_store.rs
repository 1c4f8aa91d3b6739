// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

/// The object store holding both input log objects and output match/error
/// objects. Treated as an external collaborator through its wire contract
/// only (§6); reachable over plain HTTPS GET/PUT against a per-deployment
/// endpoint, the same way the host's own HTTP state backend reaches its
/// remote store.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;
}

pub struct HttpObjectStoreClient {
    client: Client,
    endpoint: String,
}

impl HttpObjectStoreClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), bucket, key)
    }
}

#[async_trait]
impl ObjectStoreClient for HttpObjectStoreClient {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, key);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("object store returned an error status for {url}"))?
            .bytes()
            .await
            .with_context(|| format!("reading body for {url}"))?;
        Ok(bytes.to_vec())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let url = self.object_url(bucket, key);
        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("PUT {url}"))?
            .error_for_status()
            .with_context(|| format!("object store returned an error status for {url}"))?;
        Ok(())
    }
}
