//! Container-backed one-shot executor.
//!
//! Each call gets a fresh scratch directory and a fresh container; both are
//! destroyed unconditionally afterwards, including on error paths. The
//! sandbox never outlives the call.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::agent;
use crate::docker::DockerProvider;
use crate::docker::ResourceLimits;
use crate::docker::one_shot_container_name;
use crate::error::ExecuteErr;
use crate::error::Result;
use crate::serializer::Serializer;
use datalab_protocol::ResultEnvelope;

pub struct OneShotExecutor {
    provider: Arc<DockerProvider>,
    limits: ResourceLimits,
    serializer: Serializer,
}

impl OneShotExecutor {
    pub fn new(provider: Arc<DockerProvider>, limits: ResourceLimits, serializer: Serializer) -> Self {
        Self {
            provider,
            limits,
            serializer,
        }
    }

    pub async fn run(
        &self,
        code: &str,
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ResultEnvelope> {
        let scratch = tempfile::Builder::new().prefix("datalab-exec-").tempdir()?;

        // The container writes result.json here as its own non-root uid, so
        // the scratch directory must be world-writable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(
                scratch.path(),
                std::fs::Permissions::from_mode(0o777),
            )
            .await?;
        }

        if let Some(bytes) = data {
            tokio::fs::write(scratch.path().join(agent::DATA_FILE_NAME), bytes).await?;
        }
        let script = agent::render_one_shot_script(code);
        tokio::fs::write(scratch.path().join(agent::SCRIPT_FILE_NAME), script).await?;

        let name = one_shot_container_name();
        let result = self.run_in_container(&name, scratch.path(), timeout).await;

        // Teardown runs no matter how the run went; the scratch directory
        // follows when `scratch` drops.
        if let Err(e) = self.provider.remove(&name).await {
            debug!("one-shot container {name} cleanup: {e}");
        }

        result
    }

    async fn run_in_container(
        &self,
        name: &str,
        scratch: &Path,
        timeout: Duration,
    ) -> Result<ResultEnvelope> {
        self.provider
            .create_one_shot(name, scratch, self.limits)
            .await
            .map_err(as_unavailable)?;
        self.provider.start(name).await.map_err(as_unavailable)?;

        let exit_code = self.provider.wait_with_deadline(name, timeout).await?;
        let (stdout, stderr) = match self.provider.logs(name).await {
            Ok(streams) => streams,
            Err(e) => {
                warn!("failed to read one-shot container logs: {e}");
                (String::new(), String::new())
            }
        };

        if exit_code != 0 {
            // User code raised (or the interpreter died): a failed result,
            // not a transport error. The traceback is on stderr.
            return Ok(ResultEnvelope {
                stdout,
                stderr,
                success: false,
                ..Default::default()
            });
        }

        let envelope = match agent::read_result_file(&scratch.join(agent::RESULT_FILE_NAME)).await? {
            Some((variables, visualizations)) => self.serializer.envelope_from_parts(
                variables,
                visualizations,
                stdout,
                stderr,
                true,
            ),
            None => ResultEnvelope {
                stdout,
                stderr,
                success: true,
                ..Default::default()
            },
        };
        Ok(envelope)
    }
}

/// Failures to create or start a container mean the provider cannot give us
/// a sandbox; that must surface as `SandboxUnavailable`, never as a silent
/// downgrade to some other execution path.
fn as_unavailable(err: ExecuteErr) -> ExecuteErr {
    match err {
        ExecuteErr::Docker(e) => ExecuteErr::SandboxUnavailable(e.to_string()),
        other => other,
    }
}
