use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use datalab_core::config::BackendKind;

#[derive(Parser, Debug)]
#[command(name = "datalab", version)]
pub struct Cli {
    /// Directory holding `config.toml`. Defaults to `~/.datalab`.
    #[arg(long = "datalab-home", value_name = "DIR")]
    pub datalab_home: Option<PathBuf>,

    /// Execution backend override.
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Sandbox image override.
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute code in a sandbox and print the result.
    Exec {
        /// Code to execute, or `-` to read it from stdin.
        code: Option<String>,

        /// Run inside this session's sandbox, keeping variables across calls.
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,

        /// Parquet file exposed to the code as `df`.
        #[arg(long, value_name = "FILE")]
        data: Option<PathBuf>,

        /// Deadline in seconds; the policy default applies when omitted.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Print the full execution record as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Check code against the policy without executing it.
    Validate {
        /// Code to check, or `-` to read it from stdin.
        code: Option<String>,
    },

    /// Stop a session's sandbox and forget the session.
    DropSession {
        session_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum BackendArg {
    Docker,
    Process,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Docker => BackendKind::Docker,
            BackendArg::Process => BackendKind::Process,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn exec_with_session_and_timeout() {
        let cli = Cli::try_parse_from([
            "datalab",
            "exec",
            "--session",
            "conv-1",
            "--timeout",
            "5",
            "a = 5",
        ])
        .unwrap();
        match cli.command {
            Command::Exec {
                code,
                session,
                timeout,
                ..
            } => {
                assert_eq!(code.as_deref(), Some("a = 5"));
                assert_eq!(session.as_deref(), Some("conv-1"));
                assert_eq!(timeout, Some(5));
            }
            other => panic!("expected exec, got {other:?}"),
        }
    }

    #[test]
    fn backend_override_parses() {
        let cli =
            Cli::try_parse_from(["datalab", "--backend", "process", "validate", "x = 1"])
                .unwrap();
        assert_eq!(cli.backend, Some(BackendArg::Process));
        assert!(matches!(cli.command, Command::Validate { .. }));
    }

    #[test]
    fn drop_session_requires_an_id() {
        assert!(Cli::try_parse_from(["datalab", "drop-session"]).is_err());
        let cli = Cli::try_parse_from(["datalab", "drop-session", "conv-1"]).unwrap();
        match cli.command {
            Command::DropSession { session_id } => assert_eq!(session_id, "conv-1"),
            other => panic!("expected drop-session, got {other:?}"),
        }
    }
}
