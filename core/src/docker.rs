//! Container provider built on the Docker API.
//!
//! Everything here is mechanism: create/start/wait/kill/remove, archive
//! staging, host-port resolution, log capture. Policy about *when* to do any
//! of that lives in the executors.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bollard::Docker;
use bollard::container::Config;
use bollard::container::CreateContainerOptions;
use bollard::container::KillContainerOptions;
use bollard::container::LogOutput;
use bollard::container::LogsOptions;
use bollard::container::RemoveContainerOptions;
use bollard::container::StartContainerOptions;
use bollard::container::UploadToContainerOptions;
use bollard::container::WaitContainerOptions;
use bollard::models::HostConfig;
use bollard::models::PortBinding;
use futures::StreamExt;
use tracing::warn;

use crate::agent;
use crate::error::ExecuteErr;
use crate::error::Result;

/// Maximum bytes captured per log stream. Anything past this is read to
/// avoid back-pressure but discarded.
const MAX_STREAM_OUTPUT: usize = 10 * 1024;

const CPU_PERIOD_US: i64 = 100_000;

/// Dedicated non-root uid the image contract requires.
const SANDBOX_USER: &str = "sandbox";

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_quota_fraction: f64,
}

impl ResourceLimits {
    fn cpu_quota_us(&self) -> i64 {
        (self.cpu_quota_fraction * CPU_PERIOD_US as f64) as i64
    }
}

/// Docker container names accept `[a-zA-Z0-9_.-]`; session ids are caller
/// supplied, so everything else maps to `-`.
pub fn session_container_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("datalab-session-{safe}")
}

pub fn one_shot_container_name() -> String {
    format!("datalab-run-{}", uuid::Uuid::new_v4())
}

/// Build an in-memory tar archive of `(file name, contents)` entries, the
/// shape the Docker put-archive endpoint expects.
pub fn build_archive(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (file_name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, file_name, *bytes)?;
    }
    Ok(builder.into_inner()?)
}

pub struct DockerProvider {
    docker: Docker,
    image: String,
}

impl DockerProvider {
    /// Connect with the environment's defaults (unix socket or
    /// `DOCKER_HOST`). Connection setup failing means every request will be
    /// answered with `SandboxUnavailable`; there is deliberately no
    /// in-process fallback here.
    pub fn connect(image: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ExecuteErr::SandboxUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            image: image.to_string(),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| ExecuteErr::SandboxUnavailable(e.to_string()))
    }

    /// Create a throwaway container for one scripted run: no network, the
    /// host scratch directory bound at the working directory, every
    /// capability dropped.
    pub async fn create_one_shot(
        &self,
        name: &str,
        host_dir: &Path,
        limits: ResourceLimits,
    ) -> Result<()> {
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                host_dir.display(),
                agent::SANDBOX_WORKDIR
            )]),
            memory: Some(limits.memory_bytes),
            cpu_period: Some(CPU_PERIOD_US),
            cpu_quota: Some(limits.cpu_quota_us()),
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "python3".to_string(),
                agent::SCRIPT_FILE_NAME.to_string(),
            ]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(agent::SANDBOX_WORKDIR.to_string()),
            env: Some(vec!["PYTHONDONTWRITEBYTECODE=1".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };
        self.docker
            .create_container(Some(CreateContainerOptions { name, platform: None }), config)
            .await?;
        Ok(())
    }

    /// Create a session container: the agent port published loopback-only on
    /// a random host port, bridge network for the agent socket, same
    /// capability and resource clamps as one-shot.
    pub async fn create_session(&self, name: &str, limits: ResourceLimits) -> Result<()> {
        let container_port = format!("{}/tcp", agent::AGENT_PORT);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: None,
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port, HashMap::new());

        let host_config = HostConfig {
            memory: Some(limits.memory_bytes),
            cpu_period: Some(CPU_PERIOD_US),
            cpu_quota: Some(limits.cpu_quota_us()),
            network_mode: Some("bridge".to_string()),
            port_bindings: Some(port_bindings),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "python3".to_string(),
                "-u".to_string(),
                agent::agent_entry_path(),
            ]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(agent::SANDBOX_WORKDIR.to_string()),
            env: Some(vec!["PYTHONDONTWRITEBYTECODE=1".to_string()]),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        self.docker
            .create_container(Some(CreateContainerOptions { name, platform: None }), config)
            .await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Upload files into `dest_dir` inside the container. Works on created
    /// (not yet started) containers, which is how the agent source gets in
    /// before the entry point runs.
    pub async fn upload_archive(
        &self,
        name: &str,
        dest_dir: &str,
        entries: &[(&str, &[u8])],
    ) -> Result<()> {
        let archive = build_archive(entries)?;
        self.docker
            .upload_to_container(
                name,
                Some(UploadToContainerOptions {
                    path: dest_dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    /// Block until the container stops or the deadline passes. On deadline
    /// the container is killed and `Timeout` returned; otherwise the exit
    /// code is reported.
    pub async fn wait_with_deadline(&self, name: &str, deadline: Duration) -> Result<i64> {
        let mut wait_stream = Box::pin(
            self.docker
                .wait_container(name, Some(WaitContainerOptions { condition: "not-running" })),
        );
        match tokio::time::timeout(deadline, wait_stream.next()).await {
            Ok(Some(Ok(response))) => Ok(response.status_code),
            // Non-zero exits surface as a typed error on the wait stream;
            // that is still a normal exit for our purposes.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                Ok(code)
            }
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Err(ExecuteErr::BackendFailure(
                "container wait stream ended unexpectedly".to_string(),
            )),
            Err(_) => {
                if let Err(e) = self.kill(name).await {
                    warn!("failed to kill timed-out container {name}: {e}");
                }
                Err(ExecuteErr::Timeout)
            }
        }
    }

    /// Capture both log streams, capped per stream.
    pub async fn logs(&self, name: &str) -> Result<(String, String)> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.logs(name, Some(options)));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    push_capped(&mut stdout, &message);
                }
                LogOutput::StdErr { message } => push_capped(&mut stderr, &message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((
            String::from_utf8_lossy(&stdout).to_string(),
            String::from_utf8_lossy(&stderr).to_string(),
        ))
    }

    /// Host port the container's agent port was published on.
    pub async fn host_port(&self, name: &str, container_port: u16) -> Result<u16> {
        let inspect = self.docker.inspect_container(name, None).await?;
        let key = format!("{container_port}/tcp");
        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| {
                ExecuteErr::BackendFailure(format!("no host port published for {key}"))
            })
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let inspect = self.docker.inspect_container(name, None).await?;
        Ok(inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    pub async fn kill(&self, name: &str) -> Result<()> {
        self.docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        self.docker.restart_container(name, None).await?;
        Ok(())
    }

    /// Force-remove. Used on every teardown path; a missing container is not
    /// an error worth surfacing there, so callers typically log and move on.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}

fn push_capped(buf: &mut Vec<u8>, chunk: &[u8]) {
    let remaining = MAX_STREAM_OUTPUT.saturating_sub(buf.len());
    let take = remaining.min(chunk.len());
    buf.extend_from_slice(&chunk[..take]);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn cpu_quota_scales_with_period() {
        let limits = ResourceLimits {
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota_fraction: 0.5,
        };
        assert_eq!(limits.cpu_quota_us(), 50_000);
    }

    #[test]
    fn session_names_are_docker_safe() {
        assert_eq!(
            session_container_name("conv-42"),
            "datalab-session-conv-42"
        );
        assert_eq!(
            session_container_name("user/7 #a"),
            "datalab-session-user-7--a"
        );
    }

    #[test]
    fn archives_round_trip() {
        let archive = build_archive(&[
            ("script.py", b"x = 1".as_slice()),
            ("data.parquet", b"PAR1".as_slice()),
        ])
        .unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["script.py", "data.parquet"]);
    }

    #[test]
    fn log_capture_is_capped() {
        let mut buf = Vec::new();
        push_capped(&mut buf, &[b'a'; MAX_STREAM_OUTPUT]);
        push_capped(&mut buf, b"overflow");
        assert_eq!(buf.len(), MAX_STREAM_OUTPUT);
    }
}
