//! Isolation backend trait and implementations.
//!
//! A backend owns everything about running one script: allocating an id,
//! enforcing its own limits, classifying the outcome and releasing what it
//! allocated. The manager only picks a backend and races it against the
//! outer deadline.

mod interpreter;
mod process;
mod translate;
mod usage;
mod wrapper;

pub use interpreter::{InterpreterBackend, InterpreterTier};
pub use process::{filter_environment, ProcessBackend};
pub use translate::translate_pipeline_script;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ExecutionResult, IsolationId, IsolationLevel, IsolationRequest, ResourceUsageSnapshot};

/// The two backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Process,
    Interpreter,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Interpreter => "interpreter",
        }
    }

    /// Backend responsible for a requested level. Only `Process` leaves the
    /// in-process interpreter; an absent level gets the interpreter's default
    /// tier.
    pub const fn for_level(level: Option<IsolationLevel>) -> Self {
        match level {
            Some(IsolationLevel::Process) => Self::Process,
            _ => Self::Interpreter,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for isolation backends.
///
/// Implementations must tolerate concurrent calls from many tasks and must
/// release per-execution resources on every path out of
/// [`execute_with_id`](Self::execute_with_id), including when the future is
/// dropped before completion.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Allocate a fresh, never-reused id for `script_name`.
    fn allocate_id(&self, script_name: &str) -> IsolationId {
        IsolationId::generate(self.kind().as_str(), script_name)
    }

    /// Run `request` under a freshly allocated id.
    async fn execute_in_sandbox(&self, request: &IsolationRequest) -> ExecutionResult<Value> {
        let id = self.allocate_id(&request.script_name);
        self.execute_with_id(id, request).await
    }

    /// Run `request` under an id the caller already allocated, so the caller
    /// can terminate or sample it while it runs.
    ///
    /// Never panics and never returns an error outside the result: every
    /// failure is a `Failure` variant. The id must be registered before the
    /// returned future first yields.
    async fn execute_with_id(&self, id: IsolationId, request: &IsolationRequest) -> ExecutionResult<Value>;

    /// Stop a running execution. Returns `false` for unknown or already
    /// finished ids.
    async fn terminate_execution(&self, id: &IsolationId) -> bool;

    /// Current usage of a live execution.
    fn resource_usage(&self, id: &IsolationId) -> Option<ResourceUsageSnapshot>;

    /// Ids currently running in this backend.
    fn active_executions(&self) -> Vec<IsolationId>;

    /// Terminate everything and refuse new work. Idempotent; never fails.
    async fn cleanup(&self);
}
