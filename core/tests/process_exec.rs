//! Subprocess executor behavior with a stand-in interpreter.
//!
//! A real Python (plus the analysis stack) is not assumed on test machines;
//! a shell script playing the interpreter keeps these hermetic while
//! exercising the spawn, capture, timeout, and result-file paths.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use datalab_core::error::ExecuteErr;
use datalab_core::process::ProcessExecutor;
use datalab_core::serializer::Serializer;
use datalab_protocol::SerializedValue;
use serde_json::json;

fn fake_interpreter(dir: &tempfile::TempDir, script: &str) -> PathBuf {
    let path = dir.path().join("python3");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn executor(python_bin: PathBuf) -> ProcessExecutor {
    ProcessExecutor::new(python_bin, Serializer::new(4096))
}

#[tokio::test]
async fn zero_exit_with_result_file_yields_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_interpreter(
        &dir,
        r#"test -f script.py || exit 9
echo evaluated
printf '{"variables": {"x": 42}, "visualizations": []}' > result.json"#,
    );

    let envelope = executor(bin)
        .run("x = 42", None, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(envelope.success);
    assert!(envelope.stdout.contains("evaluated"));
    assert_eq!(
        envelope.variables.get("x"),
        Some(&SerializedValue::Scalar { value: json!(42) })
    );
}

#[tokio::test]
async fn zero_exit_without_result_file_is_an_empty_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_interpreter(&dir, "echo nothing to report");

    let envelope = executor(bin)
        .run("pass", None, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(envelope.success);
    assert!(envelope.variables.is_empty());
    assert!(envelope.visualizations.is_empty());
}

#[tokio::test]
async fn nonzero_exit_reports_failure_with_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_interpreter(
        &dir,
        r#"echo "NameError: name 'q' is not defined" >&2
exit 1"#,
    );

    let envelope = executor(bin)
        .run("q + 1", None, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!envelope.success);
    assert!(envelope.stderr.contains("NameError"));
    assert!(envelope.variables.is_empty());
}

#[tokio::test]
async fn deadline_kills_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_interpreter(&dir, "sleep 30");

    let err = executor(bin)
        .run("while True: pass", None, Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteErr::Timeout));
}

#[tokio::test]
async fn dataset_bytes_are_materialized_in_the_scratch_dir() {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_interpreter(
        &dir,
        r#"test -f data.parquet || exit 9
wc -c < data.parquet"#,
    );

    let envelope = executor(bin)
        .run("df.head()", Some(&[0u8; 64]), Duration::from_secs(5))
        .await
        .unwrap();

    assert!(envelope.success);
    assert!(envelope.stdout.contains("64"));
}
