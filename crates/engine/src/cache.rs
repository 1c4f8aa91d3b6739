// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use rulecraft_runtime::Engine as WasmEngine;

use crate::clients::control_plane::ControlPlaneClient;
use crate::error::EngineError;
use crate::model::{EngineResult, ERROR_DEDUP_PERIOD_MINUTES, REFRESH_TTL_SECONDS};
use crate::rule::{Rule, SHARED_MODULE_RULE_ID};

/// `log_type -> ordered rules` index, atomically swapped on each refresh.
type Index = HashMap<String, Vec<Arc<Rule>>>;

/// Maintains the current set of loaded rules and refreshes them from the
/// control plane on a time-based TTL.
pub struct Engine {
    wasm_engine: WasmEngine,
    control_plane: Arc<dyn ControlPlaneClient>,
    // Readers take a snapshot `Arc<Index>` for the duration of one event;
    // a refresh swaps the whole map rather than mutating entries in place.
    index: RwLock<Arc<Index>>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
    ttl_seconds: i64,
}

impl Engine {
    pub fn new(
        wasm_engine: WasmEngine,
        control_plane: Arc<dyn ControlPlaneClient>,
        ttl_seconds: Option<i64>,
    ) -> Self {
        Self {
            wasm_engine,
            control_plane,
            index: RwLock::new(Arc::new(Index::new())),
            last_refresh: Mutex::new(None),
            ttl_seconds: ttl_seconds.unwrap_or(REFRESH_TTL_SECONDS),
        }
    }

    /// Evaluates every rule registered under `log_type` against `event`,
    /// refreshing the cache first if the TTL has elapsed.
    pub async fn analyze(&self, log_type: &str, event: &Value) -> Result<Vec<EngineResult>> {
        self.refresh_if_stale().await?;

        let index = self.index.read().await.clone();
        let Some(rules) = index.get(log_type) else {
            return Ok(Vec::new());
        };

        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            let rule_result = rule.run(event, true).await?;

            if let Some(exception) = &rule_result.rule_exception {
                results.push(EngineResult {
                    rule_id: rule.metadata.rule_id.clone(),
                    rule_version: rule.metadata.version.clone(),
                    rule_tags: rule.metadata.tags.clone(),
                    rule_reports: rule.metadata.reports.clone(),
                    log_type: log_type.to_string(),
                    dedup: exception_type_name(exception),
                    dedup_period_minutes: ERROR_DEDUP_PERIOD_MINUTES,
                    event: event.clone(),
                    title: Some(exception.clone()),
                    alert_context: None,
                    error_message: Some(exception.clone()),
                });
                continue;
            }

            if rule_result.matched == Some(true) {
                let dedup = rule_result.resolve_dedup_string(&rule.metadata.rule_id);
                results.push(EngineResult {
                    rule_id: rule.metadata.rule_id.clone(),
                    rule_version: rule.metadata.version.clone(),
                    rule_tags: rule.metadata.tags.clone(),
                    rule_reports: rule.metadata.reports.clone(),
                    log_type: log_type.to_string(),
                    dedup,
                    dedup_period_minutes: rule.metadata.dedup_period_minutes,
                    event: event.clone(),
                    title: rule_result.title_output,
                    alert_context: rule_result.alert_context,
                    error_message: None,
                });
            }
        }

        Ok(results)
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        let mut last_refresh = self.last_refresh.lock().await;
        let now = Utc::now();
        let stale = match *last_refresh {
            None => true,
            Some(ts) => (now - ts).num_seconds() > self.ttl_seconds,
        };
        if !stale {
            return Ok(());
        }

        match self.control_plane.fetch_enabled_rules().await {
            Ok(raw_rules) => {
                let mut new_index: Index = HashMap::new();
                let mut loaded = 0usize;
                for raw in raw_rules {
                    if raw.id == SHARED_MODULE_RULE_ID {
                        tracing::debug!(rule_id = %raw.id, "skipping reserved shared-module id");
                        continue;
                    }
                    let rule_id = raw.id.clone();
                    let log_types = raw.resource_types.clone();
                    match Rule::load(&self.wasm_engine, raw).await {
                        Ok(rule) => {
                            let rule = Arc::new(rule);
                            for log_type in log_types {
                                new_index.entry(log_type).or_default().push(rule.clone());
                            }
                            loaded += 1;
                        }
                        Err(err) => {
                            tracing::warn!(rule_id = %rule_id, error = %err, "rule failed to load, skipping");
                        }
                    }
                }
                tracing::info!(count = loaded, "rule cache refreshed");
                *self.index.write().await = Arc::new(new_index);
                *last_refresh = Some(now);
                Ok(())
            }
            Err(err) => {
                // A refresh failure is recoverable: keep serving the stale
                // cache rather than propagating and aborting the batch.
                let err = EngineError::Transport(err);
                tracing::warn!(error = %err.as_formatted(), "rule refresh failed, continuing with stale cache");
                Ok(())
            }
        }
    }
}

fn exception_type_name(formatted: &str) -> String {
    formatted
        .split_once(':')
        .map(|(kind, _)| kind.to_string())
        .unwrap_or_else(|| formatted.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// §8 scenario 3: an errored EngineResult's `dedup` is the exception's
    /// type/function name, not the full formatted message.
    #[test]
    fn exception_type_name_takes_the_part_before_the_first_colon() {
        assert_eq!(exception_type_name("rule: boom"), "rule");
        assert_eq!(exception_type_name("Exception"), "Exception");
    }
}
