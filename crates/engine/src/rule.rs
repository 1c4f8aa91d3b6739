// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;
use wasmtime::component::Component;
use wasmtime::Store;

use rulecraft_runtime::detection_component::Plugin;
use rulecraft_runtime::state::State;
use rulecraft_runtime::Engine as WasmEngine;

use crate::error::EngineError;
use crate::model::{
    RawRule, RuleMetadata, DEFAULT_DEDUP_PERIOD_MINUTES, MAX_ALERT_CONTEXT_BYTES, MAX_DEDUP_LEN,
    MAX_TITLE_LEN,
};
use crate::utils::{ensure_valid_rule_id, truncate_with_suffix};

/// Rule component execution is bounded to this many epoch ticks after the
/// store is created; with `DEFAULT_EPOCH_TICK_INTERVAL` at 10ms this is a
/// 60 second wall-clock budget per rule instance, matching the ceiling the
/// host engine already applies to plugin components.
const EPOCH_DEADLINE_TICKS: u64 = 60_000 / 10;

const RULE_FN: &str = "rule";
const TITLE_FN: &str = "title";
const DEDUP_FN: &str = "dedup";
const ALERT_CONTEXT_FN: &str = "alert_context";

/// The reserved id for a shared-module rule. Recognized but never
/// instantiated as a standalone callable detection (see §4.2's refresh
/// protocol note on cross-rule imports).
pub const SHARED_MODULE_RULE_ID: &str = "aws_globals";

/// A compiled, callable detection unit.
pub struct Rule {
    pub metadata: RuleMetadata,
    store: Mutex<Store<State>>,
    instance: Plugin,
}

/// Raw per-function outcomes of one `run` invocation, before any
/// batch-mode default policy is layered on for the dedup string (that
/// layering happens in [`RuleResult::resolve_dedup_string`]).
#[derive(Debug, Clone, Default)]
pub struct RuleResult {
    pub matched: Option<bool>,
    pub rule_exception: Option<String>,

    pub title_output: Option<String>,
    pub title_exception: Option<String>,

    pub dedup_defined: bool,
    pub dedup_output: Option<String>,
    pub dedup_exception: Option<String>,
    /// True when `dedup` is defined and the invocation raised, regardless
    /// of whether the exception was swallowed (batch mode) or surfaced
    /// (direct-test mode). Needed because the default-dedup-string policy
    /// on a raising `dedup` bypasses the title fallback entirely.
    pub dedup_raised: bool,

    pub alert_context: Option<String>,
    pub alert_context_exception: Option<String>,
}

impl RuleResult {
    pub fn errored(&self) -> bool {
        self.rule_exception.is_some()
            || self.title_exception.is_some()
            || self.dedup_exception.is_some()
            || self.alert_context_exception.is_some()
    }

    /// Implements §4.1.1 in full.
    pub fn resolve_dedup_string(&self, rule_id: &str) -> String {
        let default = format!("defaultDedupString:{rule_id}");

        if self.dedup_defined {
            if self.dedup_raised {
                return default;
            }
            if let Some(d) = self.dedup_output.as_deref() {
                if !d.is_empty() {
                    return truncate_with_suffix(d, MAX_DEDUP_LEN);
                }
            }
            return default;
        }

        if let Some(t) = self.title_output.as_deref() {
            if !t.is_empty() {
                return truncate_with_suffix(t, MAX_DEDUP_LEN);
            }
        }
        default
    }
}

impl Rule {
    /// Constructs a Rule from a control-plane raw rule payload. Fails with
    /// a config error if required fields are missing, or if the compiled
    /// component does not export `rule`.
    pub async fn load(engine: &WasmEngine, raw: RawRule) -> Result<Self> {
        if raw.id.is_empty() {
            return Err(EngineError::Config("rule is missing required field `id`".to_string()).into());
        }
        if raw.body.is_empty() {
            return Err(EngineError::Config(format!(
                "rule `{}` is missing required field `body`",
                raw.id
            ))
            .into());
        }
        if raw.version_id.is_empty() {
            return Err(EngineError::Config(format!(
                "rule `{}` is missing required field `versionId`",
                raw.id
            ))
            .into());
        }
        ensure_valid_rule_id(&raw.id)
            .with_context(|| format!("rule `{}` has an invalid id", raw.id))?;

        let mut tags = raw.tags.clone();
        tags.sort();

        let reports = reports_sorted(&raw.reports);

        // The component bytes are materialized to a process-private
        // temporary file only for the duration of compilation; no rule
        // source persists on disk afterwards.
        let tmp = tempfile::NamedTempFile::new().context("creating temp file for rule body")?;
        tokio::fs::write(tmp.path(), raw.body.as_bytes())
            .await
            .context("writing rule body to temp file")?;

        let component = Component::from_file(&engine.inner, tmp.path()).map_err(|source| {
            EngineError::Compile {
                rule_id: raw.id.clone(),
                source,
            }
        })?;

        let mut store = Store::new(&engine.inner, State::new());
        store.set_epoch_deadline(EPOCH_DEADLINE_TICKS);

        let instance = Plugin::instantiate_async(&mut store, &component, &engine.linker)
            .await
            .with_context(|| format!("instantiating rule `{}`", raw.id))?;

        let capabilities = instance
            .rulecraft_detection_rule()
            .call_load(&mut store)
            .await
            .with_context(|| format!("rule `{}` does not export `rule`", raw.id))?;

        let metadata = RuleMetadata {
            rule_id: raw.id,
            version: raw.version_id,
            log_types: raw.resource_types,
            dedup_period_minutes: raw
                .dedup_period_minutes
                .unwrap_or(DEFAULT_DEDUP_PERIOD_MINUTES),
            tags,
            reports,
            has_title: capabilities.has_title,
            has_dedup: capabilities.has_dedup,
            has_alert_context: capabilities.has_alert_context,
        };

        Ok(Self {
            metadata,
            store: Mutex::new(store),
            instance,
        })
    }

    /// Runs the rule against one event, following the protocol in §4.1.
    pub async fn run(&self, event: &Value, batch_mode: bool) -> Result<RuleResult> {
        let payload = serde_json::to_string(event).context("encoding event as JSON")?;
        let mut store = self.store.lock().await;
        let mut result = RuleResult {
            dedup_defined: self.metadata.has_dedup,
            ..Default::default()
        };

        // Step 1: the predicate.
        match self
            .instance
            .rulecraft_detection_rule()
            .call_rule(&mut *store, &payload)
            .await
        {
            Ok(Ok(matched)) => result.matched = Some(matched),
            Ok(Err(message)) => {
                result.rule_exception = Some(
                    EngineError::RuleExec {
                        function: RULE_FN,
                        message,
                    }
                    .as_formatted(),
                );
                return Ok(result);
            }
            Err(trap) => {
                result.rule_exception = Some(
                    EngineError::RuleExec {
                        function: RULE_FN,
                        message: trap.to_string(),
                    }
                    .as_formatted(),
                );
                return Ok(result);
            }
        }

        // Step 2: in batch mode, auxiliary functions only run on a match.
        if batch_mode && result.matched != Some(true) {
            return Ok(result);
        }

        // Step 3: title.
        if self.metadata.has_title {
            match self
                .instance
                .rulecraft_detection_rule()
                .call_title(&mut *store, &payload)
                .await
            {
                Ok(Ok(title)) => {
                    result.title_output = Some(truncate_with_suffix(&title, MAX_TITLE_LEN));
                }
                Ok(Err(message)) => {
                    if batch_mode {
                        tracing::warn!(rule_id = %self.metadata.rule_id, %message, "title() raised, defaulting");
                    } else {
                        result.title_exception =
                            Some(EngineError::RuleExec { function: TITLE_FN, message }.as_formatted());
                    }
                }
                Err(trap) => {
                    if batch_mode {
                        tracing::warn!(rule_id = %self.metadata.rule_id, %trap, "title() trapped, defaulting");
                    } else {
                        result.title_exception = Some(
                            EngineError::RuleExec {
                                function: TITLE_FN,
                                message: trap.to_string(),
                            }
                            .as_formatted(),
                        );
                    }
                }
            }
        }

        // Step 4: dedup.
        if self.metadata.has_dedup {
            match self
                .instance
                .rulecraft_detection_rule()
                .call_dedup(&mut *store, &payload)
                .await
            {
                Ok(Ok(dedup)) => {
                    result.dedup_output = Some(dedup);
                }
                Ok(Err(message)) => {
                    result.dedup_raised = true;
                    if !batch_mode {
                        result.dedup_exception =
                            Some(EngineError::RuleExec { function: DEDUP_FN, message }.as_formatted());
                    }
                }
                Err(trap) => {
                    result.dedup_raised = true;
                    if !batch_mode {
                        result.dedup_exception = Some(
                            EngineError::RuleExec {
                                function: DEDUP_FN,
                                message: trap.to_string(),
                            }
                            .as_formatted(),
                        );
                    }
                }
            }
        }

        // Step 5: alert_context.
        if self.metadata.has_alert_context {
            match self
                .instance
                .rulecraft_detection_rule()
                .call_alert_context(&mut *store, &payload)
                .await
            {
                Ok(Ok(context)) => {
                    result.alert_context = Some(bound_alert_context(context));
                }
                Ok(Err(message)) => {
                    if batch_mode {
                        let fallback = serde_json::json!({ "_error": message }).to_string();
                        result.alert_context = Some(bound_alert_context(fallback));
                    } else {
                        result.alert_context_exception = Some(
                            EngineError::RuleExec {
                                function: ALERT_CONTEXT_FN,
                                message,
                            }
                            .as_formatted(),
                        );
                    }
                }
                Err(trap) => {
                    if batch_mode {
                        let fallback = serde_json::json!({ "_error": trap.to_string() }).to_string();
                        result.alert_context = Some(bound_alert_context(fallback));
                    } else {
                        result.alert_context_exception = Some(
                            EngineError::RuleExec {
                                function: ALERT_CONTEXT_FN,
                                message: trap.to_string(),
                            }
                            .as_formatted(),
                        );
                    }
                }
            }
        }

        Ok(result)
    }
}

fn bound_alert_context(context: String) -> String {
    if context.len() <= MAX_ALERT_CONTEXT_BYTES {
        return context;
    }
    serde_json::json!({
        "_error": format!(
            "alert_context output of {} bytes exceeds the {} byte limit",
            context.len(),
            MAX_ALERT_CONTEXT_BYTES
        )
    })
    .to_string()
}

/// Sorts each `reports` entry's value list, the same way `tags` is
/// sorted at construction (§4.1). Applying this to two independently
/// constructed `reports` maps with the same entries always yields
/// structurally equal output regardless of the order the control plane
/// happened to return them in — the building block the §8
/// refresh-idempotence property rests on.
pub fn reports_sorted(reports: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<String>> {
    let mut out = reports.clone();
    for v in out.values_mut() {
        v.sort();
    }
    out
}

pub fn default_epoch_timeout() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(dedup_defined: bool) -> RuleResult {
        RuleResult {
            matched: Some(true),
            dedup_defined,
            ..Default::default()
        }
    }

    /// §8's "Dedup default" law.
    #[test]
    fn defaults_when_neither_title_nor_dedup_is_defined() {
        let result = result_with(false);
        assert_eq!(result.resolve_dedup_string("r1"), "defaultDedupString:r1");
    }

    /// §8's "Title-as-dedup" law.
    #[test]
    fn falls_back_to_title_when_dedup_is_not_defined() {
        let mut result = result_with(false);
        result.title_output = Some("Failed console login".to_string());
        assert_eq!(result.resolve_dedup_string("r1"), "Failed console login");
    }

    #[test]
    fn empty_title_still_defaults_when_dedup_is_not_defined() {
        let mut result = result_with(false);
        result.title_output = Some(String::new());
        assert_eq!(result.resolve_dedup_string("r1"), "defaultDedupString:r1");
    }

    #[test]
    fn uses_dedup_output_when_defined_and_non_empty() {
        let mut result = result_with(true);
        result.dedup_output = Some("account-123".to_string());
        // A title is also present but must be ignored once dedup is defined.
        result.title_output = Some("ignored".to_string());
        assert_eq!(result.resolve_dedup_string("r1"), "account-123");
    }

    #[test]
    fn empty_dedup_output_defaults_even_though_title_is_defined() {
        let mut result = result_with(true);
        result.dedup_output = Some(String::new());
        result.title_output = Some("ignored".to_string());
        assert_eq!(result.resolve_dedup_string("r1"), "defaultDedupString:r1");
    }

    /// §4.1.1: a raising `dedup` defaults, it does not fall back to `title`.
    #[test]
    fn raising_dedup_defaults_without_falling_back_to_title() {
        let mut result = result_with(true);
        result.dedup_raised = true;
        result.title_output = Some("ignored".to_string());
        assert_eq!(result.resolve_dedup_string("r1"), "defaultDedupString:r1");
    }

    /// §8's truncation law, exercised through the dedup path specifically.
    #[test]
    fn long_dedup_output_is_truncated_to_exactly_max_len() {
        let mut result = result_with(true);
        result.dedup_output = Some("a".repeat(1001));
        let dedup = result.resolve_dedup_string("r1");
        assert_eq!(dedup.len(), 1000);
        assert!(dedup.ends_with("... (truncated)"));
    }

    #[test]
    fn errored_is_true_iff_any_exception_field_is_set() {
        let mut result = RuleResult::default();
        assert!(!result.errored());
        result.dedup_exception = Some("dedup: boom".to_string());
        assert!(result.errored());
    }

    #[test]
    fn bound_alert_context_passes_small_payloads_through() {
        let context = serde_json::json!({"k": "v"}).to_string();
        assert_eq!(bound_alert_context(context.clone()), context);
    }

    #[test]
    fn bound_alert_context_replaces_oversized_payloads_with_an_error() {
        let context = "x".repeat(MAX_ALERT_CONTEXT_BYTES + 1);
        let bounded = bound_alert_context(context);
        let parsed: Value = serde_json::from_str(&bounded).unwrap();
        assert!(parsed.get("_error").is_some());
        assert!(bounded.len() < MAX_ALERT_CONTEXT_BYTES);
    }

    /// §8's "Refresh idempotence" law, at the level this is actually
    /// deterministic: two `reports` maps with the same entries in a
    /// different per-key order sort to the same structure.
    #[test]
    fn reports_sorted_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("cis".to_string(), vec!["2.1".to_string(), "1.1".to_string()]);
        let mut b = BTreeMap::new();
        b.insert("cis".to_string(), vec!["1.1".to_string(), "2.1".to_string()]);

        assert_eq!(reports_sorted(&a), reports_sorted(&b));
    }
}
