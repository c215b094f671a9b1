//! Host-side normalization of raw agent output into the bounded envelope.
//!
//! The agent performs a first serialization pass inside the sandbox, but once
//! user code has run the agent's output is untrusted: every preview is
//! re-clamped here and every scalar re-measured, so the envelope size is
//! bounded by policy regardless of what the sandbox sent.

use std::collections::BTreeMap;

use datalab_protocol::Figure;
use datalab_protocol::ResultEnvelope;
use datalab_protocol::SerializedValue;
use datalab_protocol::wire::AgentResponse;
use serde_json::Value as JsonValue;

use crate::util::truncate_on_boundary;

pub const MAX_TABLE_PREVIEW_ROWS: usize = 10;
pub const MAX_SERIES_PREVIEW: usize = 10;
pub const MAX_ARRAY_PREVIEW: usize = 20;

#[derive(Debug, Clone)]
pub struct Serializer {
    max_scalar_bytes: usize,
}

impl Serializer {
    pub fn new(max_scalar_bytes: usize) -> Self {
        Self { max_scalar_bytes }
    }

    /// Normalize a session-mode agent response.
    pub fn envelope_from_agent(&self, response: AgentResponse) -> ResultEnvelope {
        self.envelope_from_parts(
            response.variables,
            response.visualizations,
            response.stdout,
            response.stderr,
            response.success,
        )
    }

    /// Normalize raw variables/visualizations as found in a one-shot
    /// `result.json`, joined with the stdio captured outside the sandbox.
    pub fn envelope_from_parts(
        &self,
        variables: serde_json::Map<String, JsonValue>,
        visualizations: Vec<JsonValue>,
        stdout: String,
        stderr: String,
        success: bool,
    ) -> ResultEnvelope {
        let mut out = BTreeMap::new();
        for (name, value) in variables {
            if name.starts_with('_') {
                continue;
            }
            out.insert(name, self.classify(value));
        }

        let visualizations = visualizations.into_iter().filter_map(figure_from_raw).collect();

        ResultEnvelope {
            variables: out,
            visualizations,
            stdout,
            stderr,
            success,
        }
    }

    /// Map one raw value to its bounded form. Tagged table/series/array
    /// metadata produced by the agent is recognized and re-clamped; anything
    /// else passes through as a scalar when small enough and collapses to
    /// `Opaque` otherwise.
    fn classify(&self, value: JsonValue) -> SerializedValue {
        if let Some(tagged) = as_tagged(&value) {
            match tagged {
                ("dataframe", obj) => {
                    let mut preview = json_rows(obj.get("preview"));
                    preview.truncate(MAX_TABLE_PREVIEW_ROWS);
                    return SerializedValue::Table {
                        shape: table_shape(obj.get("shape")),
                        columns: string_list(obj.get("columns")),
                        preview,
                    };
                }
                ("series", obj) => {
                    let mut preview = serde_json::Map::new();
                    if let Some(JsonValue::Object(entries)) = obj.get("preview") {
                        for (k, v) in entries.iter().take(MAX_SERIES_PREVIEW) {
                            preview.insert(k.clone(), v.clone());
                        }
                    }
                    return SerializedValue::Series {
                        length: obj.get("length").and_then(JsonValue::as_u64).unwrap_or(0),
                        preview,
                    };
                }
                ("array", obj) => {
                    let mut preview = match obj.get("preview") {
                        Some(JsonValue::Array(items)) => items.clone(),
                        _ => Vec::new(),
                    };
                    preview.truncate(MAX_ARRAY_PREVIEW);
                    return SerializedValue::Array {
                        shape: u64_list(obj.get("shape")),
                        preview,
                    };
                }
                _ => {}
            }
        }

        match serde_json::to_string(&value) {
            Ok(serialized) if serialized.len() <= self.max_scalar_bytes => {
                SerializedValue::Scalar { value }
            }
            Ok(serialized) => SerializedValue::Opaque {
                repr: truncate_on_boundary(&serialized, self.max_scalar_bytes).to_string(),
            },
            Err(_) => SerializedValue::Opaque {
                repr: "<unserializable>".to_string(),
            },
        }
    }
}

/// The agent tags structured values as `{"type": "...", ...}`.
fn as_tagged(value: &JsonValue) -> Option<(&str, &serde_json::Map<String, JsonValue>)> {
    let obj = value.as_object()?;
    let tag = obj.get("type")?.as_str()?;
    Some((tag, obj))
}

/// Figures arrive as `{"type": "image", "format": "png", "content": b64}` or
/// `{"type": "plotly", "content": spec}`. Anything unrecognized is dropped
/// rather than passed through unbounded.
fn figure_from_raw(value: JsonValue) -> Option<Figure> {
    let (tag, obj) = as_tagged(&value)?;
    match tag {
        "image" => {
            use base64::Engine;
            let base64 = obj.get("content")?.as_str()?.to_string();
            // Reject empty or undecodable payloads instead of shipping them
            // to callers.
            if base64.is_empty()
                || base64::engine::general_purpose::STANDARD
                    .decode(&base64)
                    .is_err()
            {
                return None;
            }
            let format = obj
                .get("format")
                .and_then(JsonValue::as_str)
                .unwrap_or("png")
                .to_string();
            Some(Figure::Raster { format, base64 })
        }
        "plotly" => Some(Figure::Vector {
            spec: obj.get("content")?.clone(),
        }),
        _ => None,
    }
}

fn table_shape(value: Option<&JsonValue>) -> [u64; 2] {
    let dims = u64_list(value);
    [
        dims.first().copied().unwrap_or(0),
        dims.get(1).copied().unwrap_or(0),
    ]
}

fn u64_list(value: Option<&JsonValue>) -> Vec<u64> {
    match value {
        Some(JsonValue::Array(items)) => {
            items.iter().filter_map(JsonValue::as_u64).collect()
        }
        _ => Vec::new(),
    }
}

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn json_rows(value: Option<&JsonValue>) -> Vec<serde_json::Map<String, JsonValue>> {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect(),
        _ => Vec::new(),
    }
}
