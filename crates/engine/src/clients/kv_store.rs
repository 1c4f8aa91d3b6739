// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// The alert-dedup KV store (§4.4). Treated as an external collaborator
/// through its wire contract only: a DynamoDB-shaped JSON `update_item`
/// protocol reachable over HTTPS, using the same low-dependency HTTP
/// client approach the host's own remote-state backend uses rather than
/// pulling in a full AWS SDK.
#[async_trait]
pub trait KvStoreClient: Send + Sync {
    /// Attempts the conditional (new-alert) update. `Ok(None)` means the
    /// condition failed and the caller must fall back to a merge update.
    async fn conditional_new_alert(
        &self,
        req: &ConditionalUpdateRequest,
    ) -> Result<Option<AlertPostImage>>;

    async fn merge_existing_alert(&self, req: &MergeUpdateRequest) -> Result<AlertPostImage>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionalUpdateRequest {
    pub partition_key: String,
    pub rule_id: String,
    pub rule_version: String,
    pub dedup: String,
    pub processing_time_epoch: i64,
    pub event_count: u64,
    pub log_type: String,
    pub context: Option<String>,
    pub title: Option<String>,
    pub is_rule_error: bool,
    pub dedup_period_minutes: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeUpdateRequest {
    pub partition_key: String,
    pub processing_time_epoch: i64,
    pub event_count: u64,
    pub log_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertPostImage {
    pub alert_count: u64,
    pub alert_creation_time_epoch: i64,
}

pub struct HttpKvStoreClient {
    client: Client,
    endpoint: String,
    table: String,
}

impl HttpKvStoreClient {
    pub fn new(endpoint: String, table: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            table,
        }
    }
}

#[derive(Serialize)]
struct UpdateItemEnvelope<'a, T> {
    table_name: &'a str,
    operation: &'static str,
    request: &'a T,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type")]
    error_type: Option<String>,
}

const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailedException";

#[async_trait]
impl KvStoreClient for HttpKvStoreClient {
    async fn conditional_new_alert(
        &self,
        req: &ConditionalUpdateRequest,
    ) -> Result<Option<AlertPostImage>> {
        let envelope = UpdateItemEnvelope {
            table_name: &self.table,
            operation: "conditional_update_item",
            request: req,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .await
            .context("sending conditional update_item request")?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body: ErrorBody = response
                .json()
                .await
                .context("decoding conditional update_item error body")?;
            if body.error_type.as_deref() == Some(CONDITIONAL_CHECK_FAILED) {
                return Ok(None);
            }
            anyhow::bail!("update_item failed: {:?}", body.error_type);
        }

        let image: AlertPostImage = response
            .error_for_status()
            .context("update_item returned an error status")?
            .json()
            .await
            .context("decoding update_item post-image")?;
        Ok(Some(image))
    }

    async fn merge_existing_alert(&self, req: &MergeUpdateRequest) -> Result<AlertPostImage> {
        let envelope = UpdateItemEnvelope {
            table_name: &self.table,
            operation: "merge_update_item",
            request: req,
        };

        let image: AlertPostImage = self
            .client
            .post(&self.endpoint)
            .json(&envelope)
            .send()
            .await
            .context("sending merge update_item request")?
            .error_for_status()
            .context("merge update_item returned an error status")?
            .json()
            .await
            .context("decoding merge update_item post-image")?;
        Ok(image)
    }
}

pub fn epoch_to_datetime(epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now)
}
