// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;

use crate::cache::Engine;
use crate::clients::object_store::ObjectStoreClient;
use crate::error::EngineError;
use crate::output_buffer::OutputBuffer;

/// The batch input envelope (§6): a list of queue records, each wrapping
/// an S3-notification-shaped body and an `id` message attribute carrying
/// the log type.
#[derive(Debug, Deserialize)]
pub struct BatchEnvelope {
    #[serde(rename = "Records")]
    pub records: Vec<QueueRecord>,
}

#[derive(Debug, Deserialize)]
pub struct QueueRecord {
    pub body: String,
    #[serde(rename = "messageAttributes")]
    pub message_attributes: MessageAttributes,
}

#[derive(Debug, Deserialize)]
pub struct MessageAttributes {
    pub id: StringValue,
}

#[derive(Debug, Deserialize)]
pub struct StringValue {
    #[serde(rename = "stringValue")]
    pub string_value: String,
}

#[derive(Debug, Deserialize)]
struct InnerBody {
    #[serde(rename = "Records")]
    records: Vec<S3NotificationRecord>,
}

#[derive(Debug, Deserialize)]
struct S3NotificationRecord {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

/// Reads the input envelope, resolves referenced compressed objects,
/// streams them line by line, parses JSON, and feeds the Engine (§4.5).
pub struct Ingestor {
    engine: Arc<Engine>,
    object_store: Arc<dyn ObjectStoreClient>,
}

impl Ingestor {
    pub fn new(engine: Arc<Engine>, object_store: Arc<dyn ObjectStoreClient>) -> Self {
        Self {
            engine,
            object_store,
        }
    }

    /// Runs the full batch: every parsed event is analyzed and routed into
    /// `buffer`. The caller is responsible for calling `buffer.flush()`
    /// once all records in the envelope have been ingested.
    pub async fn run(&self, envelope: BatchEnvelope, buffer: &mut OutputBuffer) -> Result<usize> {
        let mut matched = 0usize;

        for record in envelope.records {
            let log_type = record.message_attributes.id.string_value.clone();
            let inner: InnerBody = serde_json::from_str(&record.body)
                .context("parsing queue record body as an S3 notification envelope")?;

            for notification in inner.records {
                let bucket = notification.s3.bucket.name;
                let key = percent_encoding::percent_decode_str(&notification.s3.object.key)
                    .decode_utf8_lossy()
                    .into_owned();

                tracing::debug!(%bucket, %key, log_type = %log_type, "loading object from object store");
                let bytes = self
                    .object_store
                    .get_object(&bucket, &key)
                    .await
                    .with_context(|| format!("fetching object {bucket}/{key}"))?;

                for line in decompress_lines(&bytes)? {
                    let event: Value = match serde_json::from_str(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            // Do not log the raw payload, only the error (§4.5).
                            let err = EngineError::Parse(err.to_string());
                            tracing::error!(error = %err.as_formatted(), "data is not valid JSON");
                            continue;
                        }
                    };

                    let results = self.engine.analyze(&log_type, &event).await?;
                    for result in results {
                        matched += 1;
                        buffer.add(result).await?;
                    }
                }
            }
        }

        Ok(matched)
    }
}

/// Gzip-decompresses `bytes` and splits it into newline-delimited lines,
/// mirroring the original's `GzipFile` + `TextIOWrapper` streaming
/// reader without requiring the whole decompressed text to be valid
/// UTF-8 up front (a lossy decode matches the original's best-effort
/// "log and continue" parsing posture).
fn decompress_lines(bytes: &[u8]) -> Result<Vec<String>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .context("decompressing gzip object body")?;

    Ok(text
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip(data: &str) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn decompresses_and_splits_ndjson_lines() {
        let body = gzip("{\"a\":1}\n{\"a\":2}\n");
        let lines = decompress_lines(&body).unwrap();
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"a\":2}".to_string()]);
    }

    #[test]
    fn skips_blank_lines() {
        let body = gzip("{\"a\":1}\n\n{\"a\":2}\n");
        let lines = decompress_lines(&body).unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn parses_the_batch_envelope_shape() {
        let raw = serde_json::json!({
            "Records": [{
                "body": serde_json::to_string(&serde_json::json!({
                    "Records": [{
                        "s3": {
                            "bucket": {"name": "my-bucket"},
                            "object": {"key": "logs/2024/01/01/data.json.gz"}
                        }
                    }]
                })).unwrap(),
                "messageAttributes": {"id": {"stringValue": "AWS.CloudTrail"}}
            }]
        });
        let envelope: BatchEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.records.len(), 1);
        assert_eq!(envelope.records[0].message_attributes.id.string_value, "AWS.CloudTrail");
    }
}
