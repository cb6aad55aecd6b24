//! End-to-end behaviour of the manager over the real backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use pipeline_sandbox::backend::filter_environment;
use pipeline_sandbox::{
    ExecutionContext, ExecutionKey, ExecutionResult, IsolationLevel, IsolationRequest, ResourceLimits,
    SandboxConfig, SandboxError, SandboxManager, ViolationKind,
};

fn manager_in(temp_root: &std::path::Path) -> SandboxManager {
    let mut config = SandboxConfig::default();
    config.process.temp_root = Some(temp_root.to_path_buf());
    config.process.grace_period_ms = 500;
    SandboxManager::new(config)
}

fn at(level: IsolationLevel, script: &str) -> IsolationRequest {
    IsolationRequest::new(script, "prop").with_context(ExecutionContext::default().with_level(level))
}

fn spin(level: IsolationLevel, script: &str, wall_ms: i64) -> IsolationRequest {
    IsolationRequest::new(script, "spin").with_context(
        ExecutionContext::default()
            .with_level(level)
            .with_limits(ResourceLimits::default().with_wall_time_ms(wall_ms)),
    )
}

fn scratch_entries(root: &std::path::Path) -> usize {
    std::fs::read_dir(root).map_or(0, Iterator::count)
}

#[tokio::test]
async fn least_restrictive_level_returns_four() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());

    let result: ExecutionResult<i64> = manager
        .execute_securely(&at(IsolationLevel::Trusted, "return 2+2"))
        .await;
    match result {
        ExecutionResult::Success { value, usage, .. } => {
            assert_eq!(value, 4);
            assert!(usage.memory_bytes.is_some());
        }
        ExecutionResult::Failure { reason, .. } => panic!("unexpected failure: {reason}"),
    }
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn non_zero_exit_is_never_success() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());

    for script in ["exit 1", "exit 2", "exit 3", "kill -9 $$"] {
        let result: ExecutionResult<Value> = manager.execute_securely(&at(IsolationLevel::Process, script)).await;
        assert!(!result.is_success(), "{script} succeeded");
        assert!(matches!(result, ExecutionResult::Failure { .. }));
    }
    let result: ExecutionResult<Value> = manager.execute_securely(&at(IsolationLevel::Process, "exit 0")).await;
    assert!(result.is_success());
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn cleanup_is_total_on_every_path() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());

    let scripts = [
        at(IsolationLevel::Process, "echo ok"),
        at(IsolationLevel::Process, "exit 2"),
        at(IsolationLevel::Process, "sudo true"),
        spin(IsolationLevel::Process, "while :; do :; done", 150),
        spin(IsolationLevel::Isolated, "while (true) {}", 150),
        at(IsolationLevel::Isolated, "throw new Error('x')"),
    ];
    for request in &scripts {
        let _: ExecutionResult<Value> = manager.execute_securely(request).await;
        assert!(manager.get_active_executions().is_empty());
        assert_eq!(scratch_entries(root.path()), 0, "scratch left behind by {}", request.script);
    }
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn wall_time_limit_takes_precedence() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());

    for request in [
        spin(IsolationLevel::Process, "sleep 5", 100),
        spin(IsolationLevel::Isolated, "const end = Date.now() + 5000; while (Date.now() < end) {}", 100),
    ] {
        let started = Instant::now();
        let result: ExecutionResult<Value> = manager.execute_securely(&request).await;
        let elapsed = started.elapsed();
        assert_eq!(result.violation_kind(), Some(ViolationKind::ExecutionTimeout));
        assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
        assert!(result.usage().is_some_and(|u| u.wall_time_ms >= 100));
    }
    assert!(manager.get_active_executions().is_empty());
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn spinning_script_times_out_within_bounds() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());

    let result: ExecutionResult<Value> = manager
        .execute_securely(&spin(IsolationLevel::Process, "while :; do :; done", 200))
        .await;
    assert_eq!(result.violation_kind(), Some(ViolationKind::ExecutionTimeout));
    let usage = result.usage().cloned().unwrap();
    assert!(usage.wall_time_ms >= 200);
    assert!(usage.wall_time_ms < 1000, "{usage:?}");
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn ignored_term_does_not_extend_the_deadline() {
    let root = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::default();
    config.process.temp_root = Some(root.path().to_path_buf());
    // A non-shell runtime runs the script directly, with no wrapper around it.
    config.process.runtime = "/usr/bin/env".into();
    config.process.runtime_args = vec!["sh".to_string()];
    config.process.grace_period_ms = 5_000;
    let manager = SandboxManager::new(config);

    let request = IsolationRequest::new("trap '' TERM; while :; do :; done", "stubborn").with_context(
        ExecutionContext::default()
            .with_level(IsolationLevel::Process)
            .with_timeout(Duration::from_millis(100)),
    );
    let started = Instant::now();
    let result: ExecutionResult<Value> = manager.execute_securely(&request).await;
    let elapsed = started.elapsed();

    assert_eq!(result.violation_kind(), Some(ViolationKind::ExecutionTimeout));
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    assert!(manager.get_active_executions().is_empty());
    assert_eq!(scratch_entries(root.path()), 0);
    manager.shutdown().await;
}

#[test]
fn environment_is_filtered() {
    let env = HashMap::from([
        ("PIPELINE_A".to_string(), "1".to_string()),
        ("PATH".to_string(), "/bin".to_string()),
        ("USER_X".to_string(), "y".to_string()),
        ("SECRET".to_string(), "z".to_string()),
    ]);
    let filtered = filter_environment(
        &env,
        &["PIPELINE_".to_string(), "USER_".to_string()],
        &["PATH".to_string()],
    );
    let visible: HashMap<String, String> = filtered.into_iter().collect();
    assert_eq!(
        visible,
        HashMap::from([
            ("PIPELINE_A".to_string(), "1".to_string()),
            ("USER_X".to_string(), "y".to_string()),
        ])
    );
}

#[cfg(unix)]
#[tokio::test]
async fn child_sees_only_filtered_environment() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());

    // PATH is a system variable and would be rejected by policy at this level.
    let request = IsolationRequest::new("env | sort | tr '\\n' ' '", "env").with_context(
        ExecutionContext::default()
            .with_level(IsolationLevel::Process)
            .with_env("PIPELINE_A", "1")
            .with_env("USER_X", "y")
            .with_env("SECRET", "z"),
    );
    let result: ExecutionResult<String> = manager.execute_securely(&request).await;
    let seen = result.value().cloned().unwrap_or_default();
    let mut names: Vec<&str> = seen
        .split_whitespace()
        .filter_map(|pair| pair.split_once('=').map(|(k, _)| k))
        .filter(|k| !k.is_empty() && k.chars().all(|c| c.is_ascii_uppercase() || c == '_'))
        .filter(|k| !matches!(*k, "PWD" | "SHLVL" | "OLDPWD" | "_"))
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["PIPELINE_A", "USER_X"], "{seen}");
    manager.shutdown().await;
}

#[tokio::test]
async fn unknown_ids_are_inert() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());
    let key = ExecutionKey::from("does-not-exist");

    assert!(!manager.terminate_execution(&key).await);
    assert!(manager.get_resource_usage(&key).is_none());
    assert!(manager.get_active_executions().is_empty());
    manager.shutdown().await;
}

#[test]
fn policy_validation_reports_every_issue() {
    let manager = SandboxManager::new(SandboxConfig::default());
    let context = ExecutionContext::default().with_limits(
        ResourceLimits::default()
            .with_memory_mb(1_000_000)
            .with_cpu_time_ms(1_000_000_000)
            .with_threads(-1),
    );
    let report = manager.validate_security_policy(&context);
    assert!(!report.is_valid());
    assert_eq!(report.issues.len(), 3, "{}", report.summary());
    assert!(report
        .issues
        .iter()
        .all(|i| i.kind == ViolationKind::ResourceLimitExceeded));
}

#[cfg(unix)]
#[tokio::test]
async fn denied_system_access_under_strict_isolation_never_succeeds() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());

    let result: ExecutionResult<Value> = manager
        .execute_securely(&at(IsolationLevel::Isolated, "return Deno.exit(0)"))
        .await;
    assert_eq!(result.violation_kind(), Some(ViolationKind::UnauthorizedSystemAccess));

    let result: ExecutionResult<Value> = manager
        .execute_securely(&at(IsolationLevel::Process, "sudo reboot"))
        .await;
    assert_eq!(result.violation_kind(), Some(ViolationKind::MaliciousCodeDetected));
    manager.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn concurrent_executions_are_independent() {
    let root = tempfile::tempdir().unwrap();
    let manager = Arc::new(manager_in(root.path()));

    let mut tasks = Vec::new();
    for i in 0..8_i64 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            let request = if i % 2 == 0 {
                at(IsolationLevel::Process, &format!("echo {i}"))
            } else {
                at(IsolationLevel::Constrained, &format!("return {i}"))
            };
            let result: ExecutionResult<i64> = manager.execute_securely(&request).await;
            (i, result.into_result())
        }));
    }
    for task in tasks {
        let (i, value) = task.await.unwrap();
        assert_eq!(value.ok(), Some(i));
    }
    assert!(manager.get_active_executions().is_empty());
    assert_eq!(scratch_entries(root.path()), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_refuses_further_work() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager_in(root.path());
    manager.shutdown().await;
    manager.shutdown().await;

    let result: ExecutionResult<Value> = manager
        .execute_securely(&at(IsolationLevel::Trusted, "return 1"))
        .await;
    assert!(matches!(result.error(), Some(SandboxError::Shutdown)));
}
