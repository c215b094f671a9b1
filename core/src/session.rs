//! Session-bound execution.
//!
//! A session keys a caller-visible identity to one live sandbox whose agent
//! owns the persistent variable environment. The executor here owns the
//! session table and the sandbox handles exclusively: nothing outside this
//! module starts, stops, or reaches into a session sandbox.
//!
//! Concurrency: executions within one session are serialized by a per-session
//! mutex held for the duration of the in-sandbox call; callers beyond the
//! bounded queue depth are rejected with `SessionBusy`. The session *table*
//! lock is a std mutex held only across map updates, never across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;
use tracing::warn;

use crate::agent;
use crate::docker::DockerProvider;
use crate::docker::ResourceLimits;
use crate::docker::session_container_name;
use crate::error::ExecuteErr;
use crate::error::Result;
use crate::serializer::Serializer;
use crate::util::backoff;
use crate::util::lock_or_poisoned;
use datalab_protocol::ResultEnvelope;
use datalab_protocol::SessionState;
use datalab_protocol::wire::AgentRequest;
use datalab_protocol::wire::AgentResponse;
use datalab_protocol::wire::HealthResponse;

/// Where a provisioned agent can be reached from the host. Always loopback
/// in the Docker implementation.
#[derive(Debug, Clone)]
pub struct SandboxEndpoint {
    pub base_url: String,
}

/// Provider-facing role for session sandboxes. The Docker implementation is
/// the production one; tests substitute a stub pointing at a mock agent.
#[async_trait]
pub trait SessionSandbox: Send + Sync {
    /// Create and start a sandbox for this session and return the agent
    /// endpoint. Must not leave a half-created sandbox behind on failure.
    async fn provision(&self, session_id: &str) -> Result<SandboxEndpoint>;

    /// Stage dataset bytes into the sandbox filesystem; returns the
    /// in-sandbox path. Idempotent for identical content.
    async fn stage_data(&self, session_id: &str, bytes: &[u8]) -> Result<String>;

    /// Restart the sandbox, discarding the agent's environment. Used after a
    /// timeout, when the agent may be wedged in user code.
    async fn restart(&self, session_id: &str) -> Result<SandboxEndpoint>;

    /// Stop and remove the sandbox.
    async fn teardown(&self, session_id: &str) -> Result<()>;
}

pub struct DockerSessionSandbox {
    provider: Arc<DockerProvider>,
    limits: ResourceLimits,
}

impl DockerSessionSandbox {
    pub fn new(provider: Arc<DockerProvider>, limits: ResourceLimits) -> Self {
        Self { provider, limits }
    }
}

#[async_trait]
impl SessionSandbox for DockerSessionSandbox {
    async fn provision(&self, session_id: &str) -> Result<SandboxEndpoint> {
        let name = session_container_name(session_id);

        // At most one live sandbox per session id: a leftover container from
        // a previous host process is removed, never adopted.
        if let Err(e) = self.provider.remove(&name).await {
            tracing::debug!("no leftover container {name} to remove: {e}");
        }

        self.provider
            .create_session(&name, self.limits)
            .await
            .map_err(|e| ExecuteErr::SandboxUnavailable(e.to_string()))?;

        let staged = async {
            // The tar entry carries the `datalab/` prefix so the upload into
            // `/opt` lands the file at the staged entry path.
            self.provider
                .upload_archive(
                    &name,
                    "/opt",
                    &[(
                        "datalab/agent_server.py",
                        agent::AGENT_SERVER_SOURCE.as_bytes(),
                    )],
                )
                .await?;
            self.provider.start(&name).await?;
            let port = self.provider.host_port(&name, agent::AGENT_PORT).await?;
            Ok::<_, ExecuteErr>(port)
        }
        .await;

        match staged {
            Ok(port) => Ok(SandboxEndpoint {
                base_url: format!("http://127.0.0.1:{port}"),
            }),
            Err(e) => {
                if let Err(cleanup) = self.provider.remove(&name).await {
                    warn!("failed to clean up half-provisioned {name}: {cleanup}");
                }
                Err(ExecuteErr::SandboxUnavailable(e.to_string()))
            }
        }
    }

    async fn stage_data(&self, session_id: &str, bytes: &[u8]) -> Result<String> {
        let name = session_container_name(session_id);
        self.provider
            .upload_archive(&name, agent::SANDBOX_WORKDIR, &[(agent::DATA_FILE_NAME, bytes)])
            .await?;
        Ok(agent::sandbox_data_path())
    }

    async fn restart(&self, session_id: &str) -> Result<SandboxEndpoint> {
        let name = session_container_name(session_id);
        self.provider.restart(&name).await?;
        let port = self.provider.host_port(&name, agent::AGENT_PORT).await?;
        Ok(SandboxEndpoint {
            base_url: format!("http://127.0.0.1:{port}"),
        })
    }

    async fn teardown(&self, session_id: &str) -> Result<()> {
        self.provider.remove(&session_container_name(session_id)).await
    }
}

struct SessionSlot {
    endpoint: Option<SandboxEndpoint>,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

struct SessionEntry {
    exec_lock: Mutex<SessionSlot>,
    waiters: AtomicUsize,
}

/// Snapshot of one session for observability.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

pub struct SessionExecutor {
    sandbox: Arc<dyn SessionSandbox>,
    client: reqwest::Client,
    serializer: Serializer,
    max_queue_depth: usize,
    health_wait: Duration,
    reload_data_on_provision: bool,
    sessions: StdMutex<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionExecutor {
    pub fn new(
        sandbox: Arc<dyn SessionSandbox>,
        serializer: Serializer,
        max_queue_depth: usize,
        health_wait: Duration,
        reload_data_on_provision: bool,
    ) -> Self {
        Self {
            sandbox,
            client: reqwest::Client::new(),
            serializer,
            max_queue_depth,
            health_wait,
            reload_data_on_provision,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    /// Run `code` in the session's sandbox, provisioning one on first use or
    /// after a fault. Executions on the same session are totally ordered.
    pub async fn run(
        &self,
        session_id: &str,
        code: &str,
        data: Option<&[u8]>,
        timeout: Duration,
        reload_data: Option<bool>,
    ) -> Result<ResultEnvelope> {
        let entry = self.entry(session_id);
        let _queue_slot = QueueGuard::acquire(&entry, self.max_queue_depth)?;
        let mut slot = entry.exec_lock.lock().await;

        self.ensure_ready(session_id, &mut slot).await?;
        let endpoint = match &slot.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                return Err(ExecuteErr::BackendFailure(
                    "session has no endpoint after provisioning".to_string(),
                ));
            }
        };

        let staged_path = match data {
            Some(bytes) => Some(self.sandbox.stage_data(session_id, bytes).await.map_err(
                |e| ExecuteErr::BackendFailure(format!("failed to stage dataset: {e}")),
            )?),
            None => None,
        };

        // Reload-on-explicit-provision: the agent is told about the dataset
        // only when this request supplied one and reload semantics are on;
        // a previously staged file alone never clobbers the `df` binding.
        let reload = reload_data.unwrap_or(self.reload_data_on_provision);
        let request = AgentRequest {
            code: code.to_string(),
            data_path: if reload { staged_path } else { None },
        };

        let response = self
            .client
            .post(format!("{}/execute", endpoint.base_url))
            .json(&request)
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let agent_response: AgentResponse = match response.json().await {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        self.fault(session_id, &mut slot).await;
                        return Err(ExecuteErr::BackendFailure(format!(
                            "agent returned an unreadable response: {e}"
                        )));
                    }
                };
                slot.last_used_at = Utc::now();
                Ok(self.serializer.envelope_from_agent(agent_response))
            }
            Ok(response) => {
                let status = response.status();
                self.fault(session_id, &mut slot).await;
                Err(ExecuteErr::BackendFailure(format!(
                    "agent answered with status {status}"
                )))
            }
            Err(e) if e.is_timeout() => {
                // The agent may be wedged in user code; its state is
                // unrecoverable. Restart so the next execution gets a fresh
                // environment under the same session id.
                info!("session {session_id} timed out; restarting sandbox");
                match self.sandbox.restart(session_id).await {
                    Ok(endpoint) => {
                        slot.endpoint = Some(endpoint);
                        slot.state = SessionState::Warming;
                    }
                    Err(restart_err) => {
                        warn!("failed to restart session {session_id}: {restart_err}");
                        slot.endpoint = None;
                        slot.state = SessionState::Faulted;
                    }
                }
                Err(ExecuteErr::Timeout)
            }
            Err(e) => {
                self.fault(session_id, &mut slot).await;
                Err(ExecuteErr::BackendFailure(e.to_string()))
            }
        }
    }

    /// Provision the session eagerly without running anything.
    pub async fn open(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id);
        let _queue_slot = QueueGuard::acquire(&entry, self.max_queue_depth)?;
        let mut slot = entry.exec_lock.lock().await;
        self.ensure_ready(session_id, &mut slot).await
    }

    /// Remove the session, stop its sandbox, forget the handle.
    pub async fn drop_session(&self, session_id: &str) -> Result<()> {
        let entry = {
            let mut sessions = lock_or_poisoned(&self.sessions);
            sessions.remove(session_id)
        };
        let Some(entry) = entry else {
            return Err(ExecuteErr::SessionNotFound(session_id.to_string()));
        };

        {
            let mut slot = entry.exec_lock.lock().await;
            slot.state = SessionState::Evicted;
            slot.endpoint = None;
        }
        if let Err(e) = self.sandbox.teardown(session_id).await {
            warn!("failed to tear down session {session_id}: {e}");
        }
        Ok(())
    }

    pub async fn info(&self, session_id: &str) -> Option<SessionInfo> {
        let entry = {
            let sessions = lock_or_poisoned(&self.sessions);
            sessions.get(session_id).cloned()
        }?;
        let slot = entry.exec_lock.lock().await;
        Some(SessionInfo {
            session_id: session_id.to_string(),
            state: slot.state,
            created_at: slot.created_at,
            last_used_at: slot.last_used_at,
        })
    }

    fn entry(&self, session_id: &str) -> Arc<SessionEntry> {
        let mut sessions = lock_or_poisoned(&self.sessions);
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                Arc::new(SessionEntry {
                    exec_lock: Mutex::new(SessionSlot {
                        endpoint: None,
                        state: SessionState::Warming,
                        created_at: now,
                        last_used_at: now,
                    }),
                    waiters: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    async fn ensure_ready(&self, session_id: &str, slot: &mut SessionSlot) -> Result<()> {
        if slot.endpoint.is_none() {
            // A provision failure leaves the slot untouched so the error
            // carries no session-state side effects.
            let endpoint = self.sandbox.provision(session_id).await?;
            info!("session {session_id} provisioned at {}", endpoint.base_url);
            slot.endpoint = Some(endpoint);
            slot.state = SessionState::Warming;
            slot.created_at = Utc::now();
        }

        if slot.state != SessionState::Ready {
            let endpoint = match &slot.endpoint {
                Some(endpoint) => endpoint.clone(),
                None => {
                    return Err(ExecuteErr::BackendFailure(
                        "session has no endpoint to health-check".to_string(),
                    ));
                }
            };
            if let Err(e) = self.wait_healthy(&endpoint).await {
                // A sandbox that never reports healthy is torn down, not
                // reused.
                self.fault(session_id, slot).await;
                return Err(e);
            }
            slot.state = SessionState::Ready;
        }
        Ok(())
    }

    async fn wait_healthy(&self, endpoint: &SandboxEndpoint) -> Result<()> {
        let url = format!("{}/health", endpoint.base_url);
        let deadline = tokio::time::Instant::now() + self.health_wait;
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            let probe = self
                .client
                .get(&url)
                .timeout(Duration::from_secs(1))
                .send()
                .await;
            if let Ok(response) = probe
                && response.status().is_success()
                && let Ok(health) = response.json::<HealthResponse>().await
                && health.is_ok()
            {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ExecuteErr::SandboxUnavailable(
                    "agent did not become healthy before the deadline".to_string(),
                ));
            }
            let delay = backoff(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    async fn fault(&self, session_id: &str, slot: &mut SessionSlot) {
        slot.state = SessionState::Faulted;
        slot.endpoint = None;
        if let Err(e) = self.sandbox.teardown(session_id).await {
            warn!("failed to tear down faulted session {session_id}: {e}");
        }
    }
}

/// Bounded admission to one session: the running execution plus up to
/// `max_depth` queued callers; everyone else is turned away immediately.
struct QueueGuard<'a> {
    entry: &'a SessionEntry,
}

impl<'a> QueueGuard<'a> {
    fn acquire(entry: &'a SessionEntry, max_depth: usize) -> Result<Self> {
        let prior = entry.waiters.fetch_add(1, Ordering::SeqCst);
        if prior > max_depth {
            entry.waiters.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecuteErr::SessionBusy);
        }
        Ok(Self { entry })
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.entry.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}
