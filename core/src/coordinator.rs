//! The execution coordinator: the front door of the core.
//!
//! One public operation carries the whole contract: `submit` creates the
//! lifecycle record, runs the policy validator, resolves the dataset, picks
//! a backend, dispatches with a deadline, and applies the single terminal
//! transition. Every submission ends in exactly one of
//! `success`/`failed`/`timeout`, with the reason on the record — including
//! submissions the validator rejected before any sandbox existed.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tracing::error;
use tracing::info;
use uuid::Uuid;

use crate::backend::BackendRequest;
use crate::backend::ExecutionBackend;
use crate::config::BackendKind;
use crate::config::Config;
use crate::error::ExecuteErr;
use crate::error::Result;
use crate::policy::PolicyValidator;
use crate::records::RecordStore;
use crate::sanitize::sanitize_code;
use datalab_protocol::ExecutionMode;
use datalab_protocol::ExecutionRecord;
use datalab_protocol::ExecutionRequest;
use datalab_protocol::ExecutionStatus;
use datalab_protocol::TableHandle;
use datalab_protocol::ValidationResult;

/// Session used when the host is configured for session mode but a request
/// carries no session id of its own.
const DEFAULT_SESSION_ID: &str = "default";

/// Resolves a table handle to the dataset bytes staged into the sandbox.
/// Implemented by the file subsystem; the core only sees bytes.
#[async_trait]
pub trait DataResolver: Send + Sync {
    async fn resolve(&self, handle: &TableHandle) -> Result<Vec<u8>>;
}

/// Resolver for deployments without a file subsystem: every handle is
/// unavailable.
pub struct NoDataResolver;

#[async_trait]
impl DataResolver for NoDataResolver {
    async fn resolve(&self, handle: &TableHandle) -> Result<Vec<u8>> {
        Err(ExecuteErr::DataUnavailable(format!(
            "no file subsystem attached; cannot resolve table {}",
            handle.table_id
        )))
    }
}

pub struct Coordinator {
    config: Arc<Config>,
    validator: PolicyValidator,
    backend: Arc<dyn ExecutionBackend>,
    resolver: Arc<dyn DataResolver>,
    records: RecordStore,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn ExecutionBackend>,
        resolver: Arc<dyn DataResolver>,
    ) -> Self {
        let validator = PolicyValidator::new(config.policy.clone());
        Self {
            config,
            validator,
            backend,
            resolver,
            records: RecordStore::new(),
        }
    }

    /// Submit code for execution and return the finalized record. Faults are
    /// encoded on the record (`status` + `stderr`); the record is terminal
    /// when this returns.
    pub async fn submit(&self, user_id: &str, request: ExecutionRequest) -> ExecutionRecord {
        let record = self
            .records
            .create(user_id, request.session_id.as_deref(), &request.code);
        let execution_id = record.execution_id;
        info!("execution {execution_id} submitted by {user_id}");

        let code = match sanitize_code(&request.code, self.config.policy.max_code_bytes) {
            Ok(code) => code,
            Err(e) => return self.fail_before_dispatch(record, &e),
        };

        // The validator always runs; the container backend may apply the
        // configured relaxed set, the subprocess backend never does.
        let validation = match self.config.backend {
            BackendKind::Docker => self.validator.validate_for_container(&code),
            BackendKind::Process => self.validator.validate(&code),
        };
        if let Err(e) = validation {
            info!("execution {execution_id} rejected: {e}");
            return self.fail_before_dispatch(record, &e);
        }

        let data = match &request.data {
            Some(handle) => match self.resolver.resolve(handle).await {
                Ok(bytes) => Some(bytes),
                Err(e) => return self.fail_before_dispatch(record, &e),
            },
            None => None,
        };

        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        if let Err(e) = self.records.mark_running(execution_id) {
            error!("failed to mark {execution_id} running: {e}");
        }

        let backend_request = BackendRequest {
            code,
            data,
            timeout,
            reload_data: request.reload_data,
        };
        // Requests naming a session always run in it; otherwise the
        // configured execution mode decides between a throwaway sandbox and
        // the deployment-wide default session.
        let started = Instant::now();
        let outcome = match request.session_id.as_deref() {
            Some(session_id) => self.backend.run_in_session(session_id, backend_request).await,
            None => match self.config.execution_mode {
                ExecutionMode::Session => {
                    self.backend
                        .run_in_session(DEFAULT_SESSION_ID, backend_request)
                        .await
                }
                ExecutionMode::OneShot => self.backend.run_one_shot(backend_request).await,
            },
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (status, stdout, stderr, envelope) = match outcome {
            Ok(envelope) => {
                let status = if envelope.success {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                };
                (
                    status,
                    envelope.stdout.clone(),
                    envelope.stderr.clone(),
                    Some(envelope),
                )
            }
            Err(ExecuteErr::Timeout) => (
                ExecutionStatus::Timeout,
                String::new(),
                ExecuteErr::Timeout.to_string(),
                None,
            ),
            Err(e) => (ExecutionStatus::Failed, String::new(), e.to_string(), None),
        };

        self.finalize_or_snapshot(record, status, stdout, stderr, envelope, elapsed_ms)
    }

    pub fn get(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.records.get(execution_id)
    }

    /// Run only the policy validator, at full strictness.
    pub fn validate(&self, code: &str) -> ValidationResult {
        let outcome = sanitize_code(code, self.config.policy.max_code_bytes)
            .and_then(|code| self.validator.validate(&code));
        match outcome {
            Ok(()) => ValidationResult {
                valid: true,
                error: None,
            },
            Err(e) => ValidationResult {
                valid: false,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn drop_session(&self, session_id: &str) -> Result<()> {
        self.backend.drop_session(session_id).await
    }

    /// Terminal transition for submissions that never reached a backend:
    /// `pending → failed` with the rejection reason on stderr. No sandbox
    /// was allocated.
    fn fail_before_dispatch(&self, record: ExecutionRecord, err: &ExecuteErr) -> ExecutionRecord {
        self.finalize_or_snapshot(
            record,
            ExecutionStatus::Failed,
            String::new(),
            err.to_string(),
            None,
            0,
        )
    }

    fn finalize_or_snapshot(
        &self,
        record: ExecutionRecord,
        status: ExecutionStatus,
        stdout: String,
        stderr: String,
        envelope: Option<datalab_protocol::ResultEnvelope>,
        elapsed_ms: u64,
    ) -> ExecutionRecord {
        match self.records.finalize(
            record.execution_id,
            status,
            stdout,
            stderr,
            envelope,
            elapsed_ms,
        ) {
            Ok(finalized) => finalized,
            Err(e) => {
                // A finalize failure is a host bug; surface the freshest row
                // we have rather than panicking mid-request.
                error!("failed to finalize {}: {e}", record.execution_id);
                self.records.get(record.execution_id).unwrap_or(record)
            }
        }
    }
}
