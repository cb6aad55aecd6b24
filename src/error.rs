//! Error taxonomy for sandboxed execution.
//!
//! Every failure a caller can observe is a [`SandboxError`]. Security-relevant
//! failures carry a [`SecurityViolation`] whose [`ViolationKind`] is the
//! machine-checkable signal used for remediation (retry, alert, block).

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::policy::ValidationReport;
use crate::types::IsolationId;

/// Closed set of reasons a sandboxed execution was rejected or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    /// Memory, CPU or thread ceiling breached.
    ResourceLimitExceeded,
    /// Filesystem capability requested without a grant.
    UnauthorizedFileAccess,
    /// Network capability requested without a grant.
    UnauthorizedNetworkAccess,
    /// Host/system capability requested without a grant.
    UnauthorizedSystemAccess,
    /// In-child monitor tripped, or the interpreter rejected the script.
    MaliciousCodeDetected,
    /// Wall-clock deadline exceeded (manager or backend clock).
    ExecutionTimeout,
}

impl ViolationKind {
    /// Stable upper-case name, as used in logs and serialized results.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourceLimitExceeded => "RESOURCE_LIMIT_EXCEEDED",
            Self::UnauthorizedFileAccess => "UNAUTHORIZED_FILE_ACCESS",
            Self::UnauthorizedNetworkAccess => "UNAUTHORIZED_NETWORK_ACCESS",
            Self::UnauthorizedSystemAccess => "UNAUTHORIZED_SYSTEM_ACCESS",
            Self::MaliciousCodeDetected => "MALICIOUS_CODE_DETECTED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
        }
    }

    /// Whether an automatic retry is reasonable for this kind.
    ///
    /// Only timeouts qualify; anything else would re-run code that already
    /// misbehaved.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ExecutionTimeout)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified security failure for one execution.
#[derive(Debug, Error)]
#[error("{kind} in {isolation_id}: {message}")]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub isolation_id: IsolationId,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SecurityViolation {
    pub fn new(kind: ViolationKind, isolation_id: IsolationId, message: impl Into<String>) -> Self {
        Self {
            kind,
            isolation_id,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying error that led to this violation.
    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Errors that can end a sandboxed execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Security-relevant failure with a machine-checkable kind.
    #[error(transparent)]
    Violation(#[from] SecurityViolation),

    /// Script failed on its own terms (exit code 2, uncaught script error).
    #[error("Script failed: {message}")]
    Script {
        message: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Process ended with an exit code outside the sandbox contract.
    #[error("Unexpected exit ({}): {output}", describe_code(.exit_code))]
    UnexpectedExit { exit_code: Option<i32>, output: String },

    /// The backend itself could not start the execution.
    #[error("Failed to launch sandbox: {message}")]
    Launch {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Request rejected by policy validation before any allocation.
    #[error("Security policy rejected request: {}", .0.summary())]
    PolicyRejected(ValidationReport),

    /// Execution was cancelled through `terminate_execution`.
    #[error("Execution {0} was terminated")]
    Terminated(IsolationId),

    /// Script value could not be mapped onto the caller's type.
    #[error("Result conversion failed: {0}")]
    ResultConversion(String),

    /// The manager has been shut down and accepts no more work.
    #[error("Sandbox manager is shut down")]
    Shutdown,
}

#[allow(clippy::ref_option)]
fn describe_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"))
}

impl SandboxError {
    /// Launch failure caused by an I/O error.
    pub fn launch(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Launch {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Launch failure without an underlying I/O error.
    pub fn launch_msg(message: impl Into<String>) -> Self {
        Self::Launch {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a violation without an underlying cause.
    pub fn violation(kind: ViolationKind, id: &IsolationId, message: impl Into<String>) -> Self {
        Self::Violation(SecurityViolation::new(kind, id.clone(), message))
    }

    /// The violation kind a caller can pattern-match on, if any.
    pub fn violation_kind(&self) -> Option<ViolationKind> {
        match self {
            Self::Violation(v) => Some(v.kind),
            Self::PolicyRejected(report) => report.issues.first().map(|issue| issue.kind),
            _ => None,
        }
    }

    /// Whether the failure is an `EXECUTION_TIMEOUT`.
    pub fn is_timeout(&self) -> bool {
        self.violation_kind() == Some(ViolationKind::ExecutionTimeout)
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
