// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

/// The pub/sub topic announcing new output objects. Treated as an external
/// collaborator through its wire contract only (§6): the message body is
/// S3-notification-shaped JSON, with `type`/`id` message attributes.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        message: &Value,
        attributes: &HashMap<String, String>,
    ) -> Result<()>;
}

#[derive(serde::Serialize)]
struct PublishRequest<'a> {
    topic: &'a str,
    message: &'a Value,
    message_attributes: &'a HashMap<String, String>,
}

pub struct HttpPubSubClient {
    client: Client,
    endpoint: String,
}

impl HttpPubSubClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl PubSubClient for HttpPubSubClient {
    async fn publish(
        &self,
        topic: &str,
        message: &Value,
        attributes: &HashMap<String, String>,
    ) -> Result<()> {
        let request = PublishRequest {
            topic,
            message,
            message_attributes: attributes,
        };
        self.client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?
            .error_for_status()
            .with_context(|| format!("pub/sub endpoint returned an error status for topic {topic}"))?;
        Ok(())
    }
}
