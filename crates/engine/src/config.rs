// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{DEFAULT_DEDUP_PERIOD_MINUTES, MAX_BYTES_IN_MEMORY, REFRESH_TTL_SECONDS};

/// Operational configuration, layered the same way the host CLI layers
/// its own: defaults, an optional YAML file, then `RULECRAFT_`-prefixed
/// environment variables taking final precedence.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// DynamoDB-style table name holding open-alert rows (`ALERTS_DEDUP_TABLE`).
    pub alerts_dedup_table: String,
    /// Control-plane API host, no scheme (`ANALYSIS_API_FQDN`).
    pub analysis_api_fqdn: String,
    /// Control-plane API base path (`ANALYSIS_API_PATH`).
    pub analysis_api_path: String,
    /// Output object store bucket (`S3_BUCKET`).
    pub s3_bucket: String,
    /// Pub/sub topic ARN/identifier for output notifications (`NOTIFICATIONS_TOPIC`).
    pub notifications_topic: String,
    /// Signing region (`AWS_DEFAULT_REGION`).
    pub aws_default_region: String,

    /// Rule cache refresh interval, in seconds. Default matches §4.2's 5 minutes.
    #[serde(default = "default_refresh_ttl_seconds")]
    pub refresh_ttl_seconds: i64,
    /// OutputBuffer memory-pressure threshold, in bytes. Default matches §4.3's 100MB.
    #[serde(default = "default_max_bytes_in_memory")]
    pub max_bytes_in_memory: u64,
    /// Fallback dedup period when a rule does not specify one.
    #[serde(default = "default_dedup_period_minutes")]
    pub default_dedup_period_minutes: u32,

    /// Endpoint for the KV store's `update_item`-shaped HTTP contract.
    /// Credential acquisition is out of scope (§1); this is the URL the
    /// already-authenticated client below is pointed at.
    pub kv_store_endpoint: String,
    /// Endpoint for the object store's GET/PUT contract.
    pub object_store_endpoint: String,
    /// Endpoint for the pub/sub publish contract.
    pub pubsub_endpoint: String,

    /// AWS-style access key id used to sign control-plane requests (§6).
    #[serde(default)]
    pub aws_access_key_id: String,
    #[serde(default)]
    pub aws_secret_access_key: String,
    #[serde(default)]
    pub aws_session_token: Option<String>,
}

fn default_refresh_ttl_seconds() -> i64 {
    REFRESH_TTL_SECONDS
}

fn default_max_bytes_in_memory() -> u64 {
    MAX_BYTES_IN_MEMORY
}

fn default_dedup_period_minutes() -> u32 {
    DEFAULT_DEDUP_PERIOD_MINUTES
}

const ENV_PREFIX: &str = "RULECRAFT_";

impl Config {
    /// Loads configuration from an optional YAML file (with `${VAR}`
    /// substitution when template markers are present, mirroring the
    /// host CLI's `envsubst` pass) layered under environment variables.
    pub fn load(yaml_path: Option<&std::path::Path>) -> Result<Self> {
        use figment::providers::{Env, Format, Yaml};
        use figment::Figment;

        let mut figment = Figment::new();

        if let Some(path) = yaml_path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let substituted = if raw.contains("${") {
                    envsubst::substitute(&raw, &env_vars())
                        .with_context(|| "substituting ${VAR} templates in config file")?
                } else {
                    raw
                };
                figment = figment.merge(Yaml::string(&substituted));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        let mut config: Config = figment
            .extract()
            .context("missing or invalid configuration: required environment variables are ALERTS_DEDUP_TABLE, ANALYSIS_API_FQDN, ANALYSIS_API_PATH, S3_BUCKET, NOTIFICATIONS_TOPIC, AWS_DEFAULT_REGION")?;

        // Standard AWS credential variable names, left un-prefixed since
        // credential acquisition is itself out of scope (§1); this only
        // reads whatever the host environment already exports.
        if config.aws_access_key_id.is_empty() {
            if let Ok(v) = std::env::var("AWS_ACCESS_KEY_ID") {
                config.aws_access_key_id = v;
            }
        }
        if config.aws_secret_access_key.is_empty() {
            if let Ok(v) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                config.aws_secret_access_key = v;
            }
        }
        if config.aws_session_token.is_none() {
            config.aws_session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        }

        Ok(config)
    }
}

fn env_vars() -> std::collections::HashMap<String, String> {
    std::env::vars().collect()
}
