//! The loopback HTTP contract spoken with the in-sandbox runtime agent.
//!
//! Inbound types ignore unknown fields so the agent can grow its response
//! shape without breaking older hosts.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// `POST /execute` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub code: String,

    /// In-sandbox path of a parquet file to (re)load as the `df` binding
    /// before evaluating `code`. Omitted when no reload is wanted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

/// `POST /execute` response body, before host-side normalization. Variables
/// and visualizations are raw JSON here; the serializer turns them into the
/// typed, bounded envelope.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub variables: serde_json::Map<String, JsonValue>,

    #[serde(default)]
    pub visualizations: Vec<JsonValue>,
}

/// `GET /health` response body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn agent_request_omits_absent_data_path() {
        let request = AgentRequest {
            code: "x = 1".to_string(),
            data_path: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"code": "x = 1"})
        );
    }

    #[test]
    fn agent_response_tolerates_unknown_fields_and_gaps() {
        let response: AgentResponse = serde_json::from_value(json!({
            "success": true,
            "variables": {"x": 1},
            "some_future_field": {"ignored": true},
        }))
        .unwrap();
        assert!(response.success);
        assert_eq!(response.stdout, "");
        assert_eq!(response.variables.get("x"), Some(&json!(1)));
        assert!(response.visualizations.is_empty());
    }
}
