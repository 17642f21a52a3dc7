// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The task message exchanged through the queue.
//!
//! ```json
//! {"imageUrl": "http://example.com/a.png", "trace": {"x-datadog-trace-id": "..", ..}}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::trace::TraceCarrier;

pub const CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum TaskMessageError {
    #[error("Failed to encode task message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode task message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Immutable once published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::module_name_repetitions)]
pub struct TaskMessage {
    /// Not validated here; the fetcher decides whether it is usable.
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    /// Absent when the producer's tracer is disabled.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_carrier"
    )]
    pub trace: Option<TraceCarrier>,
}

impl TaskMessage {
    #[must_use]
    pub fn new(image_url: &str, trace: Option<TraceCarrier>) -> Self {
        Self {
            image_url: image_url.to_string(),
            trace,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TaskMessageError> {
        serde_json::to_vec(self).map_err(TaskMessageError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TaskMessageError> {
        serde_json::from_slice(bytes).map_err(TaskMessageError::Decode)
    }
}

/// A carrier that is not a JSON object must not cost us the task: it reads as absent, and
/// non-string entries are skipped. Keys are lowercased, so lookups are case-insensitive.
fn lenient_carrier<'de, D>(deserializer: D) -> Result<Option<TraceCarrier>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Object(map) => Ok(Some(
            map.into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k.to_lowercase(), s)),
                    _ => None,
                })
                .collect(),
        )),
        Value::Null => Ok(None),
        other => {
            debug!("Ignoring malformed trace carrier: {other}");
            Ok(None)
        }
    }
}
