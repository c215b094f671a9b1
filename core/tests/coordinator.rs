//! Coordinator lifecycle behavior against a scripted backend.
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use datalab_core::Coordinator;
use datalab_core::DataResolver;
use datalab_core::NoDataResolver;
use datalab_core::backend::BackendRequest;
use datalab_core::backend::ExecutionBackend;
use datalab_core::config::Config;
use datalab_core::error::ExecuteErr;
use datalab_core::error::Result;
use datalab_protocol::ExecutionMode;
use datalab_protocol::ExecutionRequest;
use datalab_protocol::ExecutionStatus;
use datalab_protocol::ResultEnvelope;
use datalab_protocol::SerializedValue;
use datalab_protocol::TableHandle;
use serde_json::json;

/// Backend that replays a queue of canned outcomes and counts dispatches.
#[derive(Default)]
struct ScriptedBackend {
    outcomes: StdMutex<VecDeque<Result<ResultEnvelope>>>,
    one_shot_calls: AtomicUsize,
    session_calls: AtomicUsize,
    seen_data: StdMutex<Vec<Option<usize>>>,
}

impl ScriptedBackend {
    fn with_outcomes(outcomes: Vec<Result<ResultEnvelope>>) -> Arc<Self> {
        let backend = Self::default();
        *backend.outcomes.lock().unwrap() = outcomes.into();
        Arc::new(backend)
    }

    fn next_outcome(&self) -> Result<ResultEnvelope> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ResultEnvelope::default()))
    }

    fn dispatches(&self) -> usize {
        self.one_shot_calls.load(Ordering::SeqCst) + self.session_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn run_one_shot(&self, request: BackendRequest) -> Result<ResultEnvelope> {
        self.one_shot_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_data
            .lock()
            .unwrap()
            .push(request.data.map(|d| d.len()));
        self.next_outcome()
    }

    async fn open_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    async fn run_in_session(
        &self,
        _session_id: &str,
        request: BackendRequest,
    ) -> Result<ResultEnvelope> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_data
            .lock()
            .unwrap()
            .push(request.data.map(|d| d.len()));
        self.next_outcome()
    }

    async fn drop_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Resolver that serves fixed bytes for any handle.
struct FixedResolver(Vec<u8>);

#[async_trait]
impl DataResolver for FixedResolver {
    async fn resolve(&self, _handle: &TableHandle) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

fn coordinator(backend: Arc<ScriptedBackend>) -> Coordinator {
    Coordinator::new(
        Arc::new(Config::default()),
        backend,
        Arc::new(NoDataResolver),
    )
}

fn request(code: &str) -> ExecutionRequest {
    ExecutionRequest {
        code: code.to_string(),
        data: None,
        session_id: None,
        timeout_ms: None,
        mode: ExecutionMode::OneShot,
        reload_data: None,
    }
}

fn success_envelope(variables: serde_json::Value) -> ResultEnvelope {
    let variables = match variables {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(name, value)| (name, SerializedValue::Scalar { value }))
            .collect(),
        _ => Default::default(),
    };
    ResultEnvelope {
        variables,
        success: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn successful_submit_walks_the_whole_lifecycle() {
    let backend =
        ScriptedBackend::with_outcomes(vec![Ok(success_envelope(json!({"z": 30})))]);
    let coordinator = coordinator(backend.clone());

    let record = coordinator.submit("user-1", request("z = 10 + 20")).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert!(record.elapsed_ms.is_some());
    let envelope = record.result.as_ref().unwrap();
    assert_eq!(
        envelope.variables.get("z"),
        Some(&SerializedValue::Scalar { value: json!(30) })
    );
    assert!(envelope.visualizations.is_empty());

    let started = record.started_at.unwrap();
    let completed = record.completed_at.unwrap();
    assert!(record.created_at <= started);
    assert!(started <= completed);

    // The record is retrievable and identical in status.
    let fetched = coordinator.get(record.execution_id).unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Success);
    assert_eq!(backend.one_shot_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn policy_rejection_never_reaches_a_backend() {
    let backend = ScriptedBackend::with_outcomes(vec![]);
    let coordinator = coordinator(backend.clone());

    let record = coordinator
        .submit("user-1", request("import os; os.system('ls')"))
        .await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.stderr.contains("not allowed"));
    assert!(record.started_at.is_none());
    assert_eq!(record.elapsed_ms, Some(0));
    assert_eq!(backend.dispatches(), 0);
}

#[tokio::test]
async fn syntax_errors_are_recorded_with_position() {
    let backend = ScriptedBackend::with_outcomes(vec![]);
    let coordinator = coordinator(backend.clone());

    let record = coordinator.submit("user-1", request("def f(:\n    pass")).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.stderr.contains("syntax error"));
    assert_eq!(backend.dispatches(), 0);
}

#[tokio::test]
async fn timeout_is_a_terminal_status_of_its_own() {
    let backend = ScriptedBackend::with_outcomes(vec![Err(ExecuteErr::Timeout)]);
    let coordinator = coordinator(backend.clone());

    let record = coordinator.submit("user-1", request("while True: pass")).await;

    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert!(record.stderr.contains("timed out"));
    assert!(record.elapsed_ms.is_some());
    assert!(record.result.is_none());
}

#[tokio::test]
async fn runtime_failure_keeps_the_envelope() {
    let failed = ResultEnvelope {
        stderr: "ZeroDivisionError: division by zero".to_string(),
        success: false,
        ..Default::default()
    };
    let backend = ScriptedBackend::with_outcomes(vec![Ok(failed)]);
    let coordinator = coordinator(backend.clone());

    let record = coordinator.submit("user-1", request("y = 1 / 0")).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.stderr.contains("ZeroDivisionError"));
    assert!(record.result.is_some());
}

#[tokio::test]
async fn session_id_routes_to_the_session_backend() {
    let backend = ScriptedBackend::with_outcomes(vec![
        Ok(success_envelope(json!({"a": 5}))),
        Ok(success_envelope(json!({"b": 10}))),
    ]);
    let coordinator = coordinator(backend.clone());

    let mut first = request("a = 5");
    first.session_id = Some("conv-1".to_string());
    first.mode = ExecutionMode::Session;
    coordinator.submit("user-1", first).await;

    let mut second = request("b = a * 2");
    second.session_id = Some("conv-1".to_string());
    second.mode = ExecutionMode::Session;
    let record = coordinator.submit("user-1", second).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(backend.session_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backend.one_shot_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn configured_session_mode_routes_sessionless_requests() {
    let backend =
        ScriptedBackend::with_outcomes(vec![Ok(success_envelope(json!({"x": 1})))]);
    let config = Config {
        execution_mode: ExecutionMode::Session,
        ..Config::default()
    };
    let coordinator =
        Coordinator::new(Arc::new(config), backend.clone(), Arc::new(NoDataResolver));

    // No session id on the request: the configured mode sends it to the
    // default session rather than a throwaway sandbox.
    let record = coordinator.submit("user-1", request("x = 1")).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(backend.session_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.one_shot_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unresolvable_data_fails_before_dispatch() {
    let backend = ScriptedBackend::with_outcomes(vec![]);
    let coordinator = coordinator(backend.clone());

    let mut req = request("df.describe()");
    req.data = Some(TableHandle {
        table_id: "tbl-404".to_string(),
        name: None,
    });
    let record = coordinator.submit("user-1", req).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.stderr.contains("dataset unavailable"));
    assert_eq!(backend.dispatches(), 0);
}

#[tokio::test]
async fn resolved_data_reaches_the_backend() {
    let backend =
        ScriptedBackend::with_outcomes(vec![Ok(success_envelope(json!({})))]);
    let coordinator = Coordinator::new(
        Arc::new(Config::default()),
        backend.clone(),
        Arc::new(FixedResolver(vec![0u8; 128])),
    );

    let mut req = request("df.describe()");
    req.data = Some(TableHandle {
        table_id: "tbl-1".to_string(),
        name: Some("sales.csv".to_string()),
    });
    let record = coordinator.submit("user-1", req).await;

    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(backend.seen_data.lock().unwrap().as_slice(), &[Some(128)]);
}

#[tokio::test]
async fn backend_faults_are_recorded_and_terminal() {
    let backend = ScriptedBackend::with_outcomes(vec![Err(ExecuteErr::SandboxUnavailable(
        "no docker daemon".to_string(),
    ))]);
    let coordinator = coordinator(backend.clone());

    let record = coordinator.submit("user-1", request("x = 1")).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.stderr.contains("no docker daemon"));
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn validate_runs_only_the_validator() {
    let backend = ScriptedBackend::with_outcomes(vec![]);
    let coordinator = coordinator(backend.clone());

    let ok = coordinator.validate("z = 10 + 20");
    assert!(ok.valid);
    assert!(ok.error.is_none());

    let bad = coordinator.validate("import os");
    assert!(!bad.valid);
    assert!(bad.error.unwrap().contains("not allowed"));

    let fenced = coordinator.validate("```python\nz = 1\n```");
    assert!(fenced.valid);

    assert_eq!(backend.dispatches(), 0);
}
