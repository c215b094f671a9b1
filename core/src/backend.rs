//! The execution backend as a polymorphic role.
//!
//! Both executors sit behind one trait so the coordinator (and anything
//! else) selects a backend purely by configuration: container isolation for
//! deployments with a security contract, plain subprocesses for local
//! development.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::BackendKind;
use crate::config::Config;
use crate::docker::DockerProvider;
use crate::docker::ResourceLimits;
use crate::error::ExecuteErr;
use crate::error::Result;
use crate::one_shot::OneShotExecutor;
use crate::process::ProcessExecutor;
use crate::serializer::Serializer;
use crate::session::DockerSessionSandbox;
use crate::session::SessionExecutor;
use crate::session::SessionSandbox;
use datalab_protocol::ResultEnvelope;

/// One execution as the backend sees it: validated code, resolved dataset
/// bytes, an effective deadline.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub code: String,
    pub data: Option<Vec<u8>>,
    pub timeout: Duration,
    pub reload_data: Option<bool>,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run_one_shot(&self, request: BackendRequest) -> Result<ResultEnvelope>;

    /// Provision a session sandbox without running anything.
    async fn open_session(&self, session_id: &str) -> Result<()>;

    async fn run_in_session(
        &self,
        session_id: &str,
        request: BackendRequest,
    ) -> Result<ResultEnvelope>;

    async fn drop_session(&self, session_id: &str) -> Result<()>;
}

/// Select and construct the backend the configuration names.
pub fn backend_from_config(config: &Config) -> Result<Arc<dyn ExecutionBackend>> {
    match config.backend {
        BackendKind::Docker => Ok(Arc::new(DockerBackend::from_config(config)?)),
        BackendKind::Process => Ok(Arc::new(ProcessBackend::from_config(config))),
    }
}

pub struct DockerBackend {
    one_shot: OneShotExecutor,
    sessions: SessionExecutor,
}

impl DockerBackend {
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = Arc::new(DockerProvider::connect(&config.sandbox_image)?);
        let serializer = Serializer::new(config.policy.max_scalar_bytes);

        let one_shot = OneShotExecutor::new(
            provider.clone(),
            ResourceLimits {
                memory_bytes: config.one_shot_memory_bytes,
                cpu_quota_fraction: config.cpu_quota_fraction,
            },
            serializer.clone(),
        );

        let sandbox: Arc<dyn SessionSandbox> = Arc::new(DockerSessionSandbox::new(
            provider,
            ResourceLimits {
                memory_bytes: config.session_memory_bytes,
                cpu_quota_fraction: config.cpu_quota_fraction,
            },
        ));
        let sessions = SessionExecutor::new(
            sandbox,
            serializer,
            config.max_queue_depth,
            config.health_wait,
            config.reload_data_on_provision,
        );

        Ok(Self { one_shot, sessions })
    }

    pub fn sessions(&self) -> &SessionExecutor {
        &self.sessions
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn run_one_shot(&self, request: BackendRequest) -> Result<ResultEnvelope> {
        self.one_shot
            .run(&request.code, request.data.as_deref(), request.timeout)
            .await
    }

    async fn open_session(&self, session_id: &str) -> Result<()> {
        self.sessions.open(session_id).await
    }

    async fn run_in_session(
        &self,
        session_id: &str,
        request: BackendRequest,
    ) -> Result<ResultEnvelope> {
        self.sessions
            .run(
                session_id,
                &request.code,
                request.data.as_deref(),
                request.timeout,
                request.reload_data,
            )
            .await
    }

    async fn drop_session(&self, session_id: &str) -> Result<()> {
        self.sessions.drop_session(session_id).await
    }
}

/// Development backend: one-shot only. Session sandboxes need container
/// isolation; rather than imitate them badly, session operations fail
/// loudly.
pub struct ProcessBackend {
    executor: ProcessExecutor,
}

impl ProcessBackend {
    pub fn from_config(config: &Config) -> Self {
        Self {
            executor: ProcessExecutor::new(
                config.python_bin.clone(),
                Serializer::new(config.policy.max_scalar_bytes),
            ),
        }
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn run_one_shot(&self, request: BackendRequest) -> Result<ResultEnvelope> {
        self.executor
            .run(&request.code, request.data.as_deref(), request.timeout)
            .await
    }

    async fn open_session(&self, _session_id: &str) -> Result<()> {
        Err(session_unsupported())
    }

    async fn run_in_session(
        &self,
        _session_id: &str,
        _request: BackendRequest,
    ) -> Result<ResultEnvelope> {
        Err(session_unsupported())
    }

    async fn drop_session(&self, _session_id: &str) -> Result<()> {
        Err(session_unsupported())
    }
}

fn session_unsupported() -> ExecuteErr {
    ExecuteErr::SandboxUnavailable(
        "session sandboxes require the docker backend".to_string(),
    )
}
