// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use md5::{Digest, Md5};

use crate::clients::kv_store::{
    epoch_to_datetime, ConditionalUpdateRequest, KvStoreClient, MergeUpdateRequest,
};
use crate::model::{AlertInfo, MatchingGroupInfo};

/// Performs the compare-and-set dance against the KV store that assigns
/// each flushed group to either a new or an existing open alert (§4.4).
pub struct AlertMerger {
    kv: Arc<dyn KvStoreClient>,
}

impl AlertMerger {
    pub fn new(kv: Arc<dyn KvStoreClient>) -> Self {
        Self { kv }
    }

    pub async fn update_and_get(&self, info: &MatchingGroupInfo) -> Result<AlertInfo> {
        let partition_key = partition_key(&info.rule_id, &info.dedup, info.is_rule_error);
        let processing_time_epoch = info.processing_time.timestamp();

        let conditional = ConditionalUpdateRequest {
            partition_key: partition_key.clone(),
            rule_id: info.rule_id.clone(),
            rule_version: info.rule_version.clone(),
            dedup: info.dedup.clone(),
            processing_time_epoch,
            event_count: info.num_matches,
            log_type: info.log_type.clone(),
            context: info.alert_context.clone(),
            title: info.title.clone(),
            is_rule_error: info.is_rule_error,
            dedup_period_minutes: info.dedup_period_minutes,
        };

        if let Some(post_image) = self.kv.conditional_new_alert(&conditional).await? {
            let alert_id = alert_id(&info.rule_id, post_image.alert_count, &info.dedup);
            return Ok(AlertInfo {
                alert_id,
                alert_creation_time: info.processing_time,
                alert_update_time: info.processing_time,
            });
        }

        // Condition failed: an open alert already exists within the dedup
        // window. Fall through to the unconditional merge.
        let merge = MergeUpdateRequest {
            partition_key,
            processing_time_epoch,
            event_count: info.num_matches,
            log_type: info.log_type.clone(),
        };
        let post_image = self.kv.merge_existing_alert(&merge).await?;
        let alert_id = alert_id(&info.rule_id, post_image.alert_count, &info.dedup);

        Ok(AlertInfo {
            alert_id,
            alert_creation_time: epoch_to_datetime(post_image.alert_creation_time_epoch),
            alert_update_time: info.processing_time,
        })
    }
}

fn partition_key(rule_id: &str, dedup: &str, is_rule_error: bool) -> String {
    let mut raw = format!("{rule_id}:{dedup}");
    if is_rule_error {
        raw.push_str(":error");
    }
    hex_md5(&raw)
}

/// §3's `AlertInfo.alert_id` is specified as 16 hex chars; the digest
/// itself is the full md5 but only its leading half is kept, the same
/// truncation Panther's own newer alert-id scheme applies.
fn alert_id(rule_id: &str, alert_count: u64, dedup: &str) -> String {
    let full = hex_md5(&format!("{rule_id}:{alert_count}:{dedup}"));
    full[..16].to_string()
}

fn hex_md5(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    format!("{digest:x}")
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_matches_spec_format() {
        // md5("r1:defaultDedupString:r1")
        let key = partition_key("r1", "defaultDedupString:r1", false);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn error_flag_changes_partition_key() {
        let without_error = partition_key("r1", "d", false);
        let with_error = partition_key("r1", "d", true);
        assert_ne!(without_error, with_error);
    }

    #[test]
    fn alert_id_is_stable_for_fixed_inputs() {
        let id = alert_id("r1", 1, "defaultDedupString:r1");
        assert_eq!(id, alert_id("r1", 1, "defaultDedupString:r1"));
        assert_ne!(id, alert_id("r1", 2, "defaultDedupString:r1"));
    }

    #[test]
    fn alert_id_is_sixteen_hex_chars() {
        let id = alert_id("r1", 1, "defaultDedupString:r1");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
