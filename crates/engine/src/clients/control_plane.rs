// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;

use crate::clients::sigv4::SigV4Signer;
use crate::model::{ControlPlaneResponse, RawRule};

/// The control plane that lists enabled rules. Treated as an external
/// collaborator through its wire contract only (§6).
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn fetch_enabled_rules(&self) -> Result<Vec<RawRule>>;
}

pub struct HttpControlPlaneClient {
    client: Client,
    fqdn: String,
    path: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl HttpControlPlaneClient {
    pub fn new(
        fqdn: String,
        path: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            fqdn,
            path,
            region,
            access_key_id,
            secret_access_key,
            session_token,
        }
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn fetch_enabled_rules(&self) -> Result<Vec<RawRule>> {
        let path = format!("/{}/enabled", self.path.trim_matches('/'));
        let query = "type=RULE";

        let signer = SigV4Signer {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            session_token: self.session_token.as_deref(),
            region: &self.region,
            service: "execute-api",
        };
        let signed = signer.sign_get(&self.fqdn, &path, query, Utc::now());

        let url = format!("https://{}{}?{}", self.fqdn, path, query);
        let mut req = self
            .client
            .get(&url)
            .header("x-amz-date", signed.x_amz_date)
            .header("Authorization", signed.authorization);
        if let Some(token) = signed.x_amz_security_token {
            req = req.header("x-amz-security-token", token);
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("control plane returned an error status for {url}"))?;

        let body: ControlPlaneResponse = response
            .json()
            .await
            .context("decoding control-plane response")?;

        Ok(body.policies)
    }
}
