use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use datalab_protocol::ExecutionMode;
use serde::Deserialize;

use crate::error::Result;

pub const CONFIG_TOML_FILE: &str = "config.toml";

/// Submitted code larger than this is rejected before validation.
pub const DEFAULT_MAX_CODE_BYTES: usize = 100 * 1024; // 100 KiB

/// JSON-native values above this size collapse to `Opaque` in the envelope.
pub const DEFAULT_MAX_SCALAR_BYTES: usize = 4 * 1024;

const DEFAULT_SANDBOX_IMAGE: &str = "datalab-sandbox";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ONE_SHOT_MEMORY_BYTES: i64 = 512 * 1024 * 1024;
const DEFAULT_SESSION_MEMORY_BYTES: i64 = 1024 * 1024 * 1024;
const DEFAULT_CPU_QUOTA_FRACTION: f64 = 0.5;
const DEFAULT_MAX_QUEUE_DEPTH: usize = 4;
const DEFAULT_HEALTH_WAIT_SECS: u64 = 10;

/// Imports whose top-level module the validator accepts by default. Mirrors
/// the analysis stack baked into the sandbox image.
const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    "collections",
    "datetime",
    "functools",
    "itertools",
    "json",
    "math",
    "matplotlib",
    "numpy",
    "pandas",
    "plotly",
    "re",
    "scipy",
    "seaborn",
    "sklearn",
    "statistics",
    "statsmodels",
    "typing",
];

/// Identifiers and attribute names rejected wherever they appear: process
/// spawning, filesystem and socket access, dynamic evaluation, and reflection
/// into the interpreter's builtins.
const DEFAULT_DENIED_TOKENS: &[&str] = &[
    "__builtins__",
    "__import__",
    "__loader__",
    "__spec__",
    "breakpoint",
    "compile",
    "ctypes",
    "eval",
    "exec",
    "importlib",
    "marshal",
    "os",
    "pickle",
    "shelve",
    "shutil",
    "socket",
    "subprocess",
    "sys",
    "urllib",
];

/// Free functions whose direct call is rejected.
const DEFAULT_BLOCKED_CALLS: &[&str] = &[
    "breakpoint",
    "compile",
    "delattr",
    "eval",
    "exec",
    "exit",
    "getattr",
    "globals",
    "input",
    "locals",
    "open",
    "quit",
    "setattr",
    "vars",
];

/// Which provider executes sandboxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Container isolation via the Docker API. Required for any deployment
    /// that carries a security contract.
    #[default]
    Docker,

    /// Plain subprocess isolation. Development only; the policy validator is
    /// the sole barrier on this path and is therefore mandatory.
    Process,
}

/// Static allow/deny policy consulted before any sandbox is provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub allowed_imports: BTreeSet<String>,
    pub denied_tokens: BTreeSet<String>,
    pub blocked_calls: BTreeSet<String>,
    pub max_code_bytes: usize,
    pub max_scalar_bytes: usize,

    /// When `true`, container-backed executions skip the denied-token and
    /// blocked-call walks (imports are still checked): the container enforces
    /// isolation at the OS layer and the static check is advisory there.
    pub container_relaxed: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_imports: DEFAULT_ALLOWED_IMPORTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            denied_tokens: DEFAULT_DENIED_TOKENS.iter().map(|s| s.to_string()).collect(),
            blocked_calls: DEFAULT_BLOCKED_CALLS.iter().map(|s| s.to_string()).collect(),
            max_code_bytes: DEFAULT_MAX_CODE_BYTES,
            max_scalar_bytes: DEFAULT_MAX_SCALAR_BYTES,
            container_relaxed: false,
        }
    }
}

/// Resolved host configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend: BackendKind,

    /// How executions without a session id are dispatched: a throwaway
    /// sandbox per call, or the deployment-wide default session. Requests
    /// carrying a session id always go to their session's sandbox.
    pub execution_mode: ExecutionMode,

    /// Image every sandbox container is created from.
    pub sandbox_image: String,

    /// Deadline applied when a request does not carry its own.
    pub default_timeout: Duration,

    pub one_shot_memory_bytes: i64,
    pub session_memory_bytes: i64,
    pub cpu_quota_fraction: f64,

    /// Callers queued on a busy session beyond this depth get `SessionBusy`.
    pub max_queue_depth: usize,

    /// Whether supplying a dataset implies telling the agent to reload the
    /// `df` binding from it, overwriting in-session edits. Requests can
    /// override per call.
    pub reload_data_on_provision: bool,

    /// Interpreter used by the subprocess backend.
    pub python_bin: PathBuf,

    /// How long to wait for a freshly provisioned agent to report healthy.
    pub health_wait: Duration,

    pub policy: Policy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            execution_mode: ExecutionMode::default(),
            sandbox_image: DEFAULT_SANDBOX_IMAGE.to_string(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            one_shot_memory_bytes: DEFAULT_ONE_SHOT_MEMORY_BYTES,
            session_memory_bytes: DEFAULT_SESSION_MEMORY_BYTES,
            cpu_quota_fraction: DEFAULT_CPU_QUOTA_FRACTION,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            reload_data_on_provision: true,
            python_bin: PathBuf::from("python3"),
            health_wait: Duration::from_secs(DEFAULT_HEALTH_WAIT_SECS),
            policy: Policy::default(),
        }
    }
}

/// On-disk representation. Every field is optional; absent fields fall back
/// to the defaults above.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    pub backend: Option<BackendKind>,
    pub execution_mode: Option<ExecutionMode>,
    pub sandbox_image: Option<String>,
    pub default_timeout_secs: Option<u64>,
    pub one_shot_memory_bytes: Option<i64>,
    pub session_memory_bytes: Option<i64>,
    pub cpu_quota_fraction: Option<f64>,
    pub max_queue_depth: Option<usize>,
    pub reload_data_on_provision: Option<bool>,
    pub python_bin: Option<PathBuf>,
    pub health_wait_secs: Option<u64>,

    #[serde(default)]
    pub policy: PolicyToml,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyToml {
    pub allowed_imports: Option<Vec<String>>,
    pub denied_tokens: Option<Vec<String>>,
    pub blocked_calls: Option<Vec<String>>,
    pub max_code_bytes: Option<usize>,
    pub max_scalar_bytes: Option<usize>,
    pub container_relaxed: Option<bool>,
}

/// Programmatic overrides that beat both the TOML file and the defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub backend: Option<BackendKind>,
    pub sandbox_image: Option<String>,
    pub default_timeout: Option<Duration>,
    pub python_bin: Option<PathBuf>,
}

impl Config {
    /// Read `config.toml` under `datalab_home` (when present) and merge it
    /// with `overrides`. A missing file yields the defaults.
    pub fn load_with_overrides(datalab_home: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let config_path = datalab_home.join(CONFIG_TOML_FILE);
        let config_toml = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            toml::from_str::<ConfigToml>(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        } else {
            ConfigToml::default()
        };
        Ok(Self::load_from_base_config_with_overrides(
            config_toml,
            overrides,
        ))
    }

    /// Merge a parsed base config with overrides. Split out so tests can
    /// build configs without touching the filesystem.
    pub fn load_from_base_config_with_overrides(
        base: ConfigToml,
        overrides: ConfigOverrides,
    ) -> Self {
        let defaults = Config::default();
        let policy_defaults = defaults.policy;

        let policy = Policy {
            allowed_imports: base
                .policy
                .allowed_imports
                .map(|v| v.into_iter().collect())
                .unwrap_or(policy_defaults.allowed_imports),
            denied_tokens: base
                .policy
                .denied_tokens
                .map(|v| v.into_iter().collect())
                .unwrap_or(policy_defaults.denied_tokens),
            blocked_calls: base
                .policy
                .blocked_calls
                .map(|v| v.into_iter().collect())
                .unwrap_or(policy_defaults.blocked_calls),
            max_code_bytes: base
                .policy
                .max_code_bytes
                .unwrap_or(policy_defaults.max_code_bytes),
            max_scalar_bytes: base
                .policy
                .max_scalar_bytes
                .unwrap_or(policy_defaults.max_scalar_bytes),
            container_relaxed: base
                .policy
                .container_relaxed
                .unwrap_or(policy_defaults.container_relaxed),
        };

        Self {
            backend: overrides
                .backend
                .or(base.backend)
                .unwrap_or(defaults.backend),
            execution_mode: base.execution_mode.unwrap_or(defaults.execution_mode),
            sandbox_image: overrides
                .sandbox_image
                .or(base.sandbox_image)
                .unwrap_or(defaults.sandbox_image),
            default_timeout: overrides
                .default_timeout
                .or(base.default_timeout_secs.map(Duration::from_secs))
                .unwrap_or(defaults.default_timeout),
            one_shot_memory_bytes: base
                .one_shot_memory_bytes
                .unwrap_or(defaults.one_shot_memory_bytes),
            session_memory_bytes: base
                .session_memory_bytes
                .unwrap_or(defaults.session_memory_bytes),
            cpu_quota_fraction: base
                .cpu_quota_fraction
                .unwrap_or(defaults.cpu_quota_fraction),
            max_queue_depth: base.max_queue_depth.unwrap_or(defaults.max_queue_depth),
            reload_data_on_provision: base
                .reload_data_on_provision
                .unwrap_or(defaults.reload_data_on_provision),
            python_bin: overrides
                .python_bin
                .or(base.python_bin)
                .unwrap_or(defaults.python_bin),
            health_wait: base
                .health_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_wait),
            policy,
        }
    }
}
