// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use rulecraft_runtime::Engine as WasmEngine;

use crate::error::EngineError;
use crate::ingestor::{BatchEnvelope, Ingestor};
use crate::model::RawRule;
use crate::output_buffer::OutputBuffer;
use crate::rule::Rule;

/// `{"rules":[{"id","body","versionId"?}], "events":[{"id","data"}]}` (§6).
#[derive(Debug, Deserialize)]
pub struct DirectTestRequest {
    pub rules: Vec<DirectRawRule>,
    pub events: Vec<DirectEvent>,
}

#[derive(Debug, Deserialize)]
pub struct DirectRawRule {
    pub id: String,
    pub body: String,
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DirectEvent {
    pub id: String,
    pub data: Value,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(schemars::JsonSchema))]
pub struct DirectTestResponse {
    pub results: Vec<DirectResult>,
}

#[derive(Debug, Default, Serialize)]
#[cfg_attr(test, derive(schemars::JsonSchema))]
pub struct DirectResult {
    pub id: String,
    #[serde(rename = "ruleId")]
    pub rule_id: String,
    pub errored: bool,
    #[serde(rename = "ruleOutput", skip_serializing_if = "Option::is_none")]
    pub rule_output: Option<bool>,
    #[serde(rename = "ruleError", skip_serializing_if = "Option::is_none")]
    pub rule_error: Option<String>,
    #[serde(rename = "titleOutput", skip_serializing_if = "Option::is_none")]
    pub title_output: Option<String>,
    #[serde(rename = "titleError", skip_serializing_if = "Option::is_none")]
    pub title_error: Option<String>,
    #[serde(rename = "dedupOutput", skip_serializing_if = "Option::is_none")]
    pub dedup_output: Option<String>,
    #[serde(rename = "dedupError", skip_serializing_if = "Option::is_none")]
    pub dedup_error: Option<String>,
    #[serde(rename = "alertContextOutput", skip_serializing_if = "Option::is_none")]
    pub alert_context_output: Option<String>,
    #[serde(rename = "alertContextError", skip_serializing_if = "Option::is_none")]
    pub alert_context_error: Option<String>,
    #[serde(rename = "genericError", skip_serializing_if = "Option::is_none")]
    pub generic_error: Option<String>,
}

/// Top-level invocation entry (§4.6): chooses between batch log analysis
/// and direct rule test based on the envelope shape.
pub struct Dispatcher {
    wasm_engine: WasmEngine,
    ingestor: Ingestor,
}

impl Dispatcher {
    pub fn new(wasm_engine: WasmEngine, ingestor: Ingestor) -> Self {
        Self {
            wasm_engine,
            ingestor,
        }
    }

    /// Returns `Some(response)` for a direct-test envelope, or `None`
    /// after having run (and flushed) the batch Ingestor path.
    pub async fn handle(
        &self,
        envelope: Value,
        buffer: &mut OutputBuffer,
    ) -> Result<Option<DirectTestResponse>> {
        if envelope.get("rules").is_some() {
            let request: DirectTestRequest =
                serde_json::from_value(envelope).context("parsing direct-test envelope")?;
            return Ok(Some(self.run_direct_test(request).await?));
        }

        let batch: BatchEnvelope =
            serde_json::from_value(envelope).context("parsing batch envelope")?;
        let matched = self.ingestor.run(batch, buffer).await?;
        buffer.flush().await?;
        tracing::info!(matched, "batch analysis complete");
        Ok(None)
    }

    async fn run_direct_test(&self, request: DirectTestRequest) -> Result<DirectTestResponse> {
        if request.rules.len() != 1 {
            bail!("exactly one rule expected, found {}", request.rules.len());
        }
        let raw = request.rules.into_iter().next().expect("length checked above");
        let rule_id = raw.id.clone();

        let raw_rule = RawRule {
            id: raw.id,
            body: raw.body,
            version_id: raw.version_id.filter(|v| !v.is_empty()).unwrap_or_else(|| "default".to_string()),
            resource_types: Vec::new(),
            dedup_period_minutes: None,
            tags: Vec::new(),
            reports: Default::default(),
        };

        let init_result = Rule::load(&self.wasm_engine, raw_rule).await;

        let mut results = Vec::with_capacity(request.events.len());
        match init_result {
            Err(init_exception) => {
                // EngineError is the narrow taxonomy a caller can branch on;
                // anything else (temp file I/O, component instantiation)
                // still carries a useful anyhow chain of its own.
                let message = init_exception
                    .downcast_ref::<EngineError>()
                    .map(EngineError::as_formatted)
                    .unwrap_or_else(|| format!("{init_exception:#}"));
                for event in request.events {
                    results.push(DirectResult {
                        id: event.id,
                        rule_id: rule_id.clone(),
                        errored: true,
                        generic_error: Some(message.clone()),
                        ..Default::default()
                    });
                }
            }
            Ok(rule) => {
                for event in request.events {
                    let rule_result = rule.run(&event.data, false).await?;
                    results.push(DirectResult {
                        id: event.id,
                        rule_id: rule_id.clone(),
                        errored: rule_result.errored(),
                        rule_output: rule_result.matched,
                        rule_error: rule_result.rule_exception,
                        title_output: rule_result.title_output,
                        title_error: rule_result.title_exception,
                        dedup_output: rule_result.dedup_output,
                        dedup_error: rule_result.dedup_exception,
                        alert_context_output: rule_result.alert_context,
                        alert_context_error: rule_result.alert_context_exception,
                        generic_error: None,
                    });
                }
            }
        }

        Ok(DirectTestResponse { results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_direct_test_envelopes_by_the_rules_key() {
        let direct = serde_json::json!({"rules": [], "events": []});
        let batch = serde_json::json!({"Records": []});
        assert!(direct.get("rules").is_some());
        assert!(batch.get("rules").is_none());
    }

    #[test]
    fn direct_test_response_omits_absent_fields() {
        let result = DirectResult {
            id: "e1".to_string(),
            rule_id: "r1".to_string(),
            errored: false,
            rule_output: Some(true),
            ..Default::default()
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["ruleOutput"], serde_json::json!(true));
        assert!(value.get("dedupError").is_none());
        assert!(value.get("genericError").is_none());
    }

    /// Pins Open Question (b) (SPEC_FULL.md §9): the direct-test response
    /// uses the richer per-outcome-field form, not a matched/errored
    /// triplet of arrays. A schema generated from the response type itself
    /// must accept a hand-built literal response shaped the way §6
    /// describes it.
    #[test]
    fn direct_test_response_matches_its_generated_schema() {
        let schema = serde_json::to_value(schemars::schema_for!(DirectTestResponse)).unwrap();

        let response = DirectTestResponse {
            results: vec![DirectResult {
                id: "e1".to_string(),
                rule_id: "r".to_string(),
                errored: true,
                rule_output: Some(true),
                dedup_error: Some("dedup: d".to_string()),
                ..Default::default()
            }],
        };
        let instance = serde_json::to_value(&response).unwrap();

        assert!(
            jsonschema::validate(&schema, &instance).is_ok(),
            "response did not validate against its own schema"
        );
    }
}
