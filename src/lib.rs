//! pipeline-sandbox library
//!
//! Secure execution core for untrusted CI/CD pipeline scripts:
//! - Policy validation against hard resource and environment ceilings
//! - Process and embedded-interpreter isolation backends
//! - A manager that enforces deadlines, tracks executions and guarantees cleanup

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod policy;
pub mod types;

pub use backend::{BackendKind, InterpreterBackend, InterpreterTier, IsolationBackend, ProcessBackend};
pub use config::SandboxConfig;
pub use error::{SandboxError, SandboxResult, SecurityViolation, ViolationKind};
pub use manager::{ActiveExecution, SandboxManager};
pub use policy::{PolicyIssue, PolicyRule, PolicyValidator, ValidationReport};
pub use types::{
    CompileOptions, EvalOptions, ExecutionContext, ExecutionKey, ExecutionResult, IsolationId, IsolationLevel,
    IsolationRequest, ResourceLimits, ResourceUsageSnapshot, ScriptDialect,
};
