//! The in-sandbox runtime agent, embedded as assets.
//!
//! Session sandboxes run `agent_server.py`: a long-lived process owning the
//! persistent variable environment, staged into the container by the
//! provisioner and spoken to over loopback HTTP. One-shot sandboxes instead
//! run a self-contained script assembled from the prelude, the user code,
//! and the postlude; results come back through `result.json` in the shared
//! working directory.

/// Source of the persistent-session agent.
pub const AGENT_SERVER_SOURCE: &str = include_str!("agent_server.py");

const ONE_SHOT_PRELUDE: &str = include_str!("oneshot_prelude.py");
const ONE_SHOT_POSTLUDE: &str = include_str!("oneshot_postlude.py");

/// Port the agent listens on inside a session container.
pub const AGENT_PORT: u16 = 5000;

/// Well-known filenames of the one-shot on-disk protocol.
pub const SCRIPT_FILE_NAME: &str = "script.py";
pub const DATA_FILE_NAME: &str = "data.parquet";
pub const RESULT_FILE_NAME: &str = "result.json";

/// Mount point of the working directory inside a sandbox.
pub const SANDBOX_WORKDIR: &str = "/app";

/// Where the session provisioner stages the agent source inside the
/// container, outside the user-writable working directory.
pub const AGENT_STAGE_DIR: &str = "/opt/datalab";
pub const AGENT_SERVER_FILE_NAME: &str = "agent_server.py";

/// In-sandbox path a staged dataset is addressed by.
pub fn sandbox_data_path() -> String {
    format!("{SANDBOX_WORKDIR}/{DATA_FILE_NAME}")
}

/// In-sandbox path of the staged agent entry point.
pub fn agent_entry_path() -> String {
    format!("{AGENT_STAGE_DIR}/{AGENT_SERVER_FILE_NAME}")
}

/// Parse a `result.json` written by the one-shot postlude into its raw
/// variables and visualizations. `None` when the file does not exist, which
/// a zero exit code treats as an empty envelope.
pub async fn read_result_file(
    path: &std::path::Path,
) -> crate::error::Result<
    Option<(
        serde_json::Map<String, serde_json::Value>,
        Vec<serde_json::Value>,
    )>,
> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let parsed: serde_json::Value = serde_json::from_slice(&contents)?;
    let variables = match parsed.get("variables") {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let visualizations = match parsed.get("visualizations") {
        Some(serde_json::Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    Ok(Some((variables, visualizations)))
}

/// Assemble the single-shot variant of the agent: prelude, user code,
/// postlude. The prelude loads `data.parquet` when present; the postlude
/// serializes surviving bindings and writes `result.json`.
pub fn render_one_shot_script(user_code: &str) -> String {
    let mut script = String::with_capacity(
        ONE_SHOT_PRELUDE.len() + user_code.len() + ONE_SHOT_POSTLUDE.len() + 2,
    );
    script.push_str(ONE_SHOT_PRELUDE);
    script.push('\n');
    script.push_str(user_code);
    script.push('\n');
    script.push_str(ONE_SHOT_POSTLUDE);
    script
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn one_shot_script_sandwiches_user_code() {
        let script = render_one_shot_script("z = 10 + 20");
        let code_at = script.find("z = 10 + 20").unwrap();
        let prelude_marker = script.find("user code follows").unwrap();
        let postlude_marker = script.find("user code ends").unwrap();
        assert!(prelude_marker < code_at);
        assert!(code_at < postlude_marker);
        assert!(script.contains(RESULT_FILE_NAME));
    }

    #[test]
    fn session_agent_serves_the_run_protocol() {
        assert!(AGENT_SERVER_SOURCE.contains("/execute"));
        assert!(AGENT_SERVER_SOURCE.contains("/health"));
        assert!(AGENT_SERVER_SOURCE.contains("port=5000"));
    }

    #[tokio::test]
    async fn missing_result_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = read_result_file(&dir.path().join(RESULT_FILE_NAME))
            .await
            .unwrap();
        assert!(parsed.is_none());
    }

    #[tokio::test]
    async fn result_file_parses_variables_and_figures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULT_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"{"variables": {"x": 42}, "visualizations": [{"type": "image", "format": "png", "content": "aGk="}]}"#,
        )
        .await
        .unwrap();
        let (variables, visualizations) = read_result_file(&path).await.unwrap().unwrap();
        assert_eq!(variables.get("x"), Some(&serde_json::json!(42)));
        assert_eq!(visualizations.len(), 1);
    }

    #[test]
    fn harness_internals_stay_out_of_results() {
        // Everything the prelude/postlude binds at module scope is either a
        // module (filtered by type) or underscore-prefixed (filtered by
        // name); spot-check the load-bearing ones.
        for name in ["_figures", "_capture_show", "_serialize_value", "_variables"] {
            let script = render_one_shot_script("x = 1");
            assert!(script.contains(name), "missing harness binding {name}");
        }
    }
}
