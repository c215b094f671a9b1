//! In-memory store of execution lifecycle rows.
//!
//! The coordinator is the sole writer. Transitions are checked against the
//! monotonic status order; an illegal transition is a host bug and is
//! rejected rather than applied. The relational store a full deployment
//! persists into is an external collaborator fed from these rows.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use uuid::Uuid;

use crate::error::ExecuteErr;
use crate::error::Result;
use crate::util::lock_or_poisoned;
use datalab_protocol::ExecutionRecord;
use datalab_protocol::ExecutionStatus;
use datalab_protocol::ResultEnvelope;

#[derive(Default)]
pub struct RecordStore {
    records: StdMutex<HashMap<Uuid, ExecutionRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh `Pending` row and return a snapshot of it.
    pub fn create(&self, user_id: &str, session_id: Option<&str>, code: &str) -> ExecutionRecord {
        let record = ExecutionRecord {
            execution_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            session_id: session_id.map(str::to_string),
            code: code.to_string(),
            status: ExecutionStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            result: None,
            elapsed_ms: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        lock_or_poisoned(&self.records).insert(record.execution_id, record.clone());
        record
    }

    pub fn get(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        lock_or_poisoned(&self.records).get(&execution_id).cloned()
    }

    /// `Pending → Running`, stamping `started_at`.
    pub fn mark_running(&self, execution_id: Uuid) -> Result<()> {
        let mut records = lock_or_poisoned(&self.records);
        let record = records
            .get_mut(&execution_id)
            .ok_or(ExecuteErr::ExecutionNotFound(execution_id))?;
        check_transition(record.status, ExecutionStatus::Running)?;
        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        Ok(())
    }

    /// Apply the single terminal transition for this execution and return
    /// the final row.
    pub fn finalize(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        stdout: String,
        stderr: String,
        result: Option<ResultEnvelope>,
        elapsed_ms: u64,
    ) -> Result<ExecutionRecord> {
        let mut records = lock_or_poisoned(&self.records);
        let record = records
            .get_mut(&execution_id)
            .ok_or(ExecuteErr::ExecutionNotFound(execution_id))?;
        check_transition(record.status, status)?;
        record.status = status;
        record.stdout = stdout;
        record.stderr = stderr;
        record.result = result;
        record.elapsed_ms = Some(elapsed_ms);
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }
}

fn check_transition(current: ExecutionStatus, next: ExecutionStatus) -> Result<()> {
    if !current.can_transition_to(next) {
        return Err(ExecuteErr::BackendFailure(format!(
            "illegal status transition {current} -> {next}"
        )));
    }
    Ok(())
}
