// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_TITLE_LEN: usize = 1000;
pub const MAX_DEDUP_LEN: usize = 1000;
pub const MAX_ALERT_CONTEXT_BYTES: usize = 200 * 1024;
pub const MAX_BYTES_IN_MEMORY: u64 = 100_000_000;
pub const REFRESH_TTL_SECONDS: i64 = 300;
pub const ERROR_DEDUP_PERIOD_MINUTES: u32 = 1440;
pub const DEFAULT_DEDUP_PERIOD_MINUTES: u32 = 60;

/// Raw rule payload as returned by the control-plane `enabled` endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    pub id: String,
    pub body: String,
    #[serde(rename = "versionId")]
    pub version_id: String,
    #[serde(rename = "resourceTypes", default)]
    pub resource_types: Vec<String>,
    #[serde(rename = "dedupPeriodMinutes")]
    pub dedup_period_minutes: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub reports: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ControlPlaneResponse {
    pub policies: Vec<RawRule>,
}

/// Rule metadata held alongside its loaded component; the descriptive
/// portion of the `Rule` entity in the data model (the callable portion
/// lives in `rule::Rule`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMetadata {
    pub rule_id: String,
    pub version: String,
    pub log_types: Vec<String>,
    pub dedup_period_minutes: u32,
    pub tags: Vec<String>,
    pub reports: BTreeMap<String, Vec<String>>,
    pub has_title: bool,
    pub has_dedup: bool,
    pub has_alert_context: bool,
}

/// Outcome of applying one rule to one event, in batch (analyze) mode.
#[derive(Debug, Clone, Serialize)]
pub struct EngineResult {
    pub rule_id: String,
    pub rule_version: String,
    pub rule_tags: Vec<String>,
    pub rule_reports: BTreeMap<String, Vec<String>>,
    pub log_type: String,
    pub dedup: String,
    pub dedup_period_minutes: u32,
    pub event: Value,
    pub title: Option<String>,
    pub alert_context: Option<String>,
    pub error_message: Option<String>,
}

impl EngineResult {
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn grouping_key(&self) -> OutputGroupingKey {
        OutputGroupingKey {
            rule_id: self.rule_id.clone(),
            log_type: self.log_type.clone(),
            dedup: self.dedup.clone(),
            is_rule_error: self.is_error(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputGroupingKey {
    pub rule_id: String,
    pub log_type: String,
    pub dedup: String,
    pub is_rule_error: bool,
}

/// Identity + timestamps of the alert a flushed group belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertInfo {
    pub alert_id: String,
    pub alert_creation_time: DateTime<Utc>,
    pub alert_update_time: DateTime<Utc>,
}

/// Summary of one flushed output group, built from the first observed
/// result's metadata (§4.3.1 rationale: rules may refresh mid-run).
#[derive(Debug, Clone)]
pub struct MatchingGroupInfo {
    pub rule_id: String,
    pub rule_version: String,
    pub log_type: String,
    pub dedup: String,
    pub dedup_period_minutes: u32,
    pub num_matches: u64,
    pub title: Option<String>,
    pub alert_context: Option<String>,
    pub is_rule_error: bool,
    pub processing_time: DateTime<Utc>,
}
