//! Lifecycle and result types for one code execution.
//!
//! An execution moves through `ExecutionStatus` monotonically:
//! `Pending → Running → {Success, Failed, Timeout}`. The coordinator is the
//! sole writer of `ExecutionRecord`; everything else only reads.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use strum_macros::Display;
use uuid::Uuid;

/// How an execution is dispatched: a throwaway sandbox per call, or a
/// long-lived per-session sandbox that keeps variable bindings between calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    OneShot,
    Session,
}

/// Reference to a columnar dataset the file subsystem can resolve to bytes.
/// The core never loads table contents itself; it stages the resolved bytes
/// into the sandbox as `data.parquet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHandle {
    pub table_id: String,

    /// Human-readable name, when the caller has one (e.g. the upload
    /// filename). Not used for resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A request as accepted by the coordinator. `timeout_ms` falls back to the
/// policy default when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<TableHandle>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// When data is supplied, send its path to the agent so the `df` binding
    /// is reloaded from source, overwriting any in-session edits. `None`
    /// defers to the host configuration default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reload_data: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }

    /// Transitions are monotonic along `Pending → Running → terminal`.
    /// `Pending → Failed` is allowed so that policy rejections terminate a
    /// record without ever entering `Running`.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed),
            Self::Running => next.is_terminal(),
            Self::Success | Self::Failed | Self::Timeout => false,
        }
    }
}

/// Persisted lifecycle row for one `submit` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub user_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub code: String,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultEnvelope>,

    /// Present iff status is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The bounded, structured result of one execution as returned to callers.
///
/// `variables` is a `BTreeMap` so serialization order is deterministic with
/// respect to variable names; `visualizations` preserves figure insertion
/// order. Test harnesses rely on both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub variables: BTreeMap<String, SerializedValue>,
    pub visualizations: Vec<Figure>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// One serialized variable. Large values never round-trip whole: tabular and
/// array shapes carry a clamped preview, and anything else that exceeds the
/// scalar budget collapses to `Opaque`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SerializedValue {
    /// JSON-native value small enough to pass through verbatim.
    Scalar { value: JsonValue },

    /// 2-D labeled table: shape, column names, and at most the first ten rows.
    Table {
        shape: [u64; 2],
        columns: Vec<String>,
        preview: Vec<serde_json::Map<String, JsonValue>>,
    },

    /// 1-D labeled sequence: length and at most the first ten entries, keyed
    /// by their label.
    Series {
        length: u64,
        preview: serde_json::Map<String, JsonValue>,
    },

    /// Dense n-dimensional numeric array: shape and at most the first twenty
    /// elements in flattened order.
    Array {
        shape: Vec<u64>,
        preview: Vec<JsonValue>,
    },

    /// Fallback textual representation for everything else.
    Opaque { repr: String },
}

/// A captured visualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Figure {
    /// Rasterized image, today always PNG.
    Raster { format: String, base64: String },

    /// Vector figure as the library's own JSON spec.
    Vector { spec: JsonValue },
}

/// Host-side view of one live session sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Warming,
    Ready,
    Evicted,
    Faulted,
}

/// Outcome of running only the policy validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Timeout));

        assert!(!Pending.can_transition_to(Success));
        assert!(!Success.can_transition_to(Running));
        assert!(!Timeout.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn serialized_value_wire_format() {
        let value = SerializedValue::Scalar { value: json!(30) };
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"type": "scalar", "value": 30})
        );

        let table = SerializedValue::Table {
            shape: [2, 1],
            columns: vec!["a".to_string()],
            preview: vec![],
        };
        assert_eq!(
            serde_json::to_value(&table).unwrap(),
            json!({"type": "table", "shape": [2, 1], "columns": ["a"], "preview": []})
        );
    }

    #[test]
    fn figure_wire_format() {
        let raster = Figure::Raster {
            format: "png".to_string(),
            base64: "aGk=".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&raster).unwrap(),
            json!({"type": "raster", "format": "png", "base64": "aGk="})
        );
    }

    #[test]
    fn envelope_variable_order_is_deterministic() {
        let mut envelope = ResultEnvelope::default();
        for name in ["zeta", "alpha", "mid"] {
            envelope
                .variables
                .insert(name.to_string(), SerializedValue::Scalar { value: json!(1) });
        }
        let serialized = serde_json::to_string(&envelope).unwrap();
        let alpha = serialized.find("alpha").unwrap();
        let mid = serialized.find("mid").unwrap();
        let zeta = serialized.find("zeta").unwrap();
        assert!(alpha < mid && mid < zeta);
    }

    #[test]
    fn execution_request_accepts_minimal_json() {
        let request: ExecutionRequest =
            serde_json::from_value(json!({"code": "z = 10 + 20"})).unwrap();
        assert_eq!(request.mode, ExecutionMode::OneShot);
        assert_eq!(request.session_id, None);
        assert_eq!(request.timeout_ms, None);
    }
}
