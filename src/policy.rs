//! Pre-dispatch security policy validation.
//!
//! Runs before any resource is allocated. Every violated rule is reported so
//! a caller can fix all of them in one round trip.

use serde::Serialize;

use crate::config::PolicyConfig;
use crate::error::ViolationKind;
use crate::types::{ExecutionContext, IsolationLevel};

/// Which rule an issue comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    MemoryLimit,
    CpuTimeLimit,
    WallTimeLimit,
    ThreadLimit,
    FileHandleLimit,
    SystemEnvironment,
    EnvironmentSize,
}

/// One violated rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyIssue {
    pub rule: PolicyRule,
    pub kind: ViolationKind,
    pub message: String,
}

/// Outcome of validating one execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<PolicyIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// All issue messages joined into one line.
    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            return "no issues".to_string();
        }
        self.issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn has(&self, rule: PolicyRule) -> bool {
        self.issues.iter().any(|i| i.rule == rule)
    }

    fn push(&mut self, rule: PolicyRule, kind: ViolationKind, message: String) {
        self.issues.push(PolicyIssue { rule, kind, message });
    }
}

/// Checks execution contexts against the configured hard ceilings.
#[derive(Debug, Clone, Default)]
pub struct PolicyValidator {
    config: PolicyConfig,
}

impl PolicyValidator {
    pub const fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Validate `context` and return every issue found.
    pub fn validate(&self, context: &ExecutionContext) -> ValidationReport {
        let mut report = ValidationReport::default();
        let limits = context.limits();
        let cfg = &self.config;

        check_limit(&mut report, PolicyRule::MemoryLimit, "memory", "MB", limits.max_memory_mb, cfg.max_memory_mb);
        check_limit(&mut report, PolicyRule::CpuTimeLimit, "CPU time", "ms", limits.max_cpu_time_ms, cfg.max_cpu_time_ms);
        check_limit(
            &mut report,
            PolicyRule::WallTimeLimit,
            "wall time",
            "ms",
            limits.max_wall_time_ms,
            cfg.max_wall_time_ms,
        );
        check_limit(&mut report, PolicyRule::ThreadLimit, "thread count", "", limits.max_threads, cfg.max_threads);
        check_limit(
            &mut report,
            PolicyRule::FileHandleLimit,
            "file handle count",
            "",
            limits.max_file_handles,
            cfg.max_file_handles,
        );

        if let Some(timeout) = context.timeout {
            let declared = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
            if declared > cfg.max_wall_time_ms {
                report.push(
                    PolicyRule::WallTimeLimit,
                    ViolationKind::ResourceLimitExceeded,
                    format!("timeout {declared}ms exceeds maximum {}ms", cfg.max_wall_time_ms),
                );
            }
        }

        match context.isolation_level {
            Some(IsolationLevel::Isolated | IsolationLevel::Process) => {
                let mut system: Vec<&str> = context
                    .environment
                    .keys()
                    .map(String::as_str)
                    .filter(|name| cfg.is_system_env(name))
                    .collect();
                if !system.is_empty() {
                    system.sort_unstable();
                    report.push(
                        PolicyRule::SystemEnvironment,
                        ViolationKind::UnauthorizedSystemAccess,
                        format!(
                            "system environment variables are not allowed at strict isolation: {}",
                            system.join(", ")
                        ),
                    );
                }
            }
            Some(IsolationLevel::Constrained) => {
                let count = context.environment.len();
                if count > cfg.max_env_vars_constrained {
                    report.push(
                        PolicyRule::EnvironmentSize,
                        ViolationKind::UnauthorizedSystemAccess,
                        format!(
                            "{count} environment variables exceed the constrained maximum of {}",
                            cfg.max_env_vars_constrained
                        ),
                    );
                }
            }
            Some(IsolationLevel::Trusted) | None => {}
        }

        report
    }
}

fn check_limit(
    report: &mut ValidationReport,
    rule: PolicyRule,
    label: &str,
    unit: &str,
    value: Option<i64>,
    cap: i64,
) {
    let Some(value) = value else { return };
    if value < 0 {
        report.push(
            rule,
            ViolationKind::ResourceLimitExceeded,
            format!("{label} must not be negative (got {value})"),
        );
    } else if value > cap {
        report.push(
            rule,
            ViolationKind::ResourceLimitExceeded,
            format!("{label} {value}{unit} exceeds maximum {cap}{unit}"),
        );
    }
}
