use std::io;

use thiserror::Error;
use tokio::task::JoinError;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ExecuteErr>;

#[derive(Error, Debug)]
pub enum ExecuteErr {
    /// Submitted code did not parse. Caller fault; no sandbox is allocated.
    #[error("syntax error at line {line}, column {column}: {message}")]
    InvalidSyntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// Submitted code hit a static policy rule. Caller fault; no sandbox is
    /// allocated. The message names the matching rule.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// The referenced dataset could not be resolved to bytes.
    #[error("dataset unavailable: {0}")]
    DataUnavailable(String),

    /// Execution exceeded its deadline. The sandbox has been killed (one-shot)
    /// or restarted (session); no partial results are returned.
    #[error("execution timed out")]
    Timeout,

    /// The sandbox provider is unreachable. Operator fault; session entries
    /// are left untouched and the host never degrades to in-process
    /// execution.
    #[error("sandbox provider unavailable: {0}")]
    SandboxUnavailable(String),

    /// Transport or agent fault after the sandbox was up. The session sandbox
    /// has been torn down; the next call re-provisions.
    #[error("execution backend failure: {0}")]
    BackendFailure(String),

    /// The per-session queue is full. Backpressure; retry later.
    #[error("session is busy")]
    SessionBusy,

    #[error("no execution with id: {0}")]
    ExecutionNotFound(Uuid),

    #[error("no session with id: {0}")]
    SessionNotFound(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl ExecuteErr {
    /// `true` for faults attributable to the submitted request rather than
    /// the host or the provider. Callers map these to 4xx-class responses.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            ExecuteErr::InvalidSyntax { .. }
                | ExecuteErr::PolicyViolation(_)
                | ExecuteErr::DataUnavailable(_)
                | ExecuteErr::Timeout
                | ExecuteErr::SessionBusy
                | ExecuteErr::ExecutionNotFound(_)
                | ExecuteErr::SessionNotFound(_)
        )
    }
}
