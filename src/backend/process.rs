//! OS-process backend.
//!
//! Each execution gets a fresh child process in its own process group, a
//! private scratch directory, and an environment rebuilt from an allow-list.
//! Shell runtimes additionally get the self-monitoring wrapper.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::usage::{self, ProcSample};
use super::wrapper::{self, WrapperSpec, SHIM_DIR, USER_SCRIPT_FILE, VIOLATION_FILE};
use super::{BackendKind, IsolationBackend};
use crate::config::ProcessConfig;
use crate::error::{SandboxError, ViolationKind};
use crate::types::{
    duration_ms, ExecutionResult, IsolationId, IsolationRequest, ResourceUsageSnapshot,
};

/// How long output pipes may keep draining after the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long to wait for the kernel to report a force-killed child.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Keep only variables whose name starts with an allowed prefix and is not
/// explicitly denied. Everything else from the caller's environment is dropped.
pub fn filter_environment(
    environment: &HashMap<String, String>,
    allow_prefixes: &[String],
    deny: &[String],
) -> BTreeMap<String, String> {
    environment
        .iter()
        .filter(|(name, _)| allow_prefixes.iter().any(|p| name.starts_with(p.as_str())))
        .filter(|(name, _)| !deny.iter().any(|d| d == *name))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitOutcome {
    Code(i32),
    Signal(Option<i32>),
    WaitFailed(String),
}

impl From<std::io::Result<std::process::ExitStatus>> for ExitOutcome {
    fn from(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => status.code().map_or_else(|| Self::Signal(signal_of(status)), Self::Code),
            Err(e) => Self::WaitFailed(e.to_string()),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: std::process::ExitStatus) -> Option<i32> {
    None
}

/// A child that is currently tracked by the backend.
struct LiveProcess {
    pid: Option<u32>,
    started: Instant,
    exit: watch::Receiver<Option<ExitOutcome>>,
    terminated: AtomicBool,
    sample: Mutex<ProcSample>,
}

impl LiveProcess {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn snapshot(&self) -> ResourceUsageSnapshot {
        let sample = *self.sample.lock();
        ResourceUsageSnapshot {
            wall_time_ms: duration_ms(self.started.elapsed()),
            memory_bytes: sample.peak_memory_bytes,
            cpu_time_ms: sample.cpu_time_ms,
            threads: sample.peak_threads,
            files_accessed: None,
            network_endpoints: None,
        }
    }

    fn refresh(&self) {
        if let Some(pid) = self.pid {
            if let Some(newer) = usage::sample_pid(pid) {
                self.sample.lock().merge(newer);
            }
        }
    }
}

type ProcessTable = RwLock<HashMap<IsolationId, Arc<LiveProcess>>>;

/// Guaranteed cleanup for one execution, run on every exit path including
/// cancellation of the execution future.
struct Cleanup<'a> {
    table: &'a ProcessTable,
    id: IsolationId,
    pid: Option<u32>,
    scratch: Option<TempDir>,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            signal_group(pid, GroupSignal::Kill);
        }
        self.table.write().remove(&self.id);
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(isolation_id = %self.id, path = %path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
        debug!(isolation_id = %self.id, "Process execution cleaned up");
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`. Returns whether anything received it.
#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let sig = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, signal = ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> bool {
    false
}

/// Backend that runs each script in a separate OS process.
pub struct ProcessBackend {
    config: ProcessConfig,
    active: ProcessTable,
    closed: AtomicBool,
}

impl ProcessBackend {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub const fn config(&self) -> &ProcessConfig {
        &self.config
    }

    fn create_scratch(&self, id: &IsolationId) -> Result<TempDir, SandboxError> {
        let prefix = format!("{id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.config.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::launch("failed to create scratch directory", e))?;
        restrict_permissions(dir.path());
        Ok(dir)
    }

    fn build_command(
        &self,
        request: &IsolationRequest,
        script_path: &Path,
        workdir: &Path,
        memory_mb: u64,
    ) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(&self.config.runtime_args);
        if let Some(flag) = &self.config.memory_flag {
            cmd.arg(flag.replace("{mb}", &memory_mb.to_string()));
        }
        cmd.arg(script_path);

        cmd.env_clear();
        cmd.envs(filter_environment(
            &request.context.environment,
            &self.config.env_allow_prefixes,
            &self.config.env_deny,
        ));

        cmd.current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(target_os = "linux")]
        forbid_privilege_gain(&mut cmd);
        cmd
    }

    fn materialize(
        &self,
        request: &IsolationRequest,
        scratch: &Path,
        memory_mb: u64,
        deadline: Duration,
    ) -> Result<PathBuf, SandboxError> {
        let path = scratch.join("script");
        if !self.config.runtime_is_shell() {
            write_file(&path, &request.script, false)?;
            return Ok(path);
        }

        let limits = request.context.limits();
        let files = wrapper::render(&WrapperSpec {
            script: &request.script,
            shell: &self.config.runtime,
            scratch_dir: scratch,
            memory_kb: memory_mb * 1024,
            cpu_seconds: limits.cpu_time().map(|d| ceil_secs(d).max(1)),
            monitor_seconds: ceil_secs(deadline) + 1,
            bindings: &request.context.bindings,
        });
        let shim_dir = scratch.join(SHIM_DIR);
        std::fs::create_dir(&shim_dir).map_err(|e| SandboxError::launch("failed to create shim directory", e))?;
        for (cmd, text) in &files.shims {
            write_file(&shim_dir.join(cmd), text, true)?;
        }
        write_file(&scratch.join(USER_SCRIPT_FILE), &files.user_script, false)?;
        write_file(&path, &files.wrapper, false)?;
        Ok(path)
    }
}

fn write_file(path: &Path, text: &str, executable: bool) -> Result<(), SandboxError> {
    std::fs::write(path, text)
        .map_err(|e| SandboxError::launch(format!("failed to write {}", path.display()), e))?;
    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| SandboxError::launch(format!("failed to mark {} executable", path.display()), e))?;
    }
    #[cfg(not(unix))]
    let _ = executable;
    Ok(())
}

/// Set `no_new_privs` in the child so setuid binaries cannot raise privileges.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn forbid_privilege_gain(cmd: &mut Command) {
    // SAFETY: the hook runs between fork and exec and only issues prctl(2),
    // which is async-signal-safe and allocates nothing.
    unsafe {
        cmd.pre_exec(|| nix::sys::prctl::set_no_new_privs().map_err(std::io::Error::from));
    }
}

/// Owner-only access on the scratch directory. Failure is logged, not fatal.
fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)) {
            warn!(path = %path.display(), error = %e, "Could not restrict scratch directory permissions");
        }
    }
    #[cfg(not(unix))]
    debug!(path = %path.display(), "Owner-only permissions not supported on this platform");
}

/// Read a pipe to EOF, keeping at most `limit` bytes.
fn spawn_reader<R>(mut reader: R, limit: usize) -> JoinHandle<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut truncated = false;
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(kept.len());
                    if n > room {
                        truncated = true;
                    }
                    kept.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        (kept, truncated)
    })
}

async fn collect_output(readers: Vec<JoinHandle<(Vec<u8>, bool)>>) -> String {
    let mut combined = String::new();
    for reader in readers {
        let abort = reader.abort_handle();
        match tokio::time::timeout(DRAIN_TIMEOUT, reader).await {
            Ok(Ok((bytes, truncated))) => {
                combined.push_str(&String::from_utf8_lossy(&bytes));
                if truncated {
                    combined.push_str("\n[output truncated]");
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Output reader failed"),
            Err(_) => {
                abort.abort();
                warn!("Output pipe still open after exit, abandoning drain");
            }
        }
    }
    combined
}

async fn wait_for_exit(mut exit: watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    let outcome = match exit.wait_for(Option::is_some).await {
        Ok(seen) => seen.clone(),
        Err(_) => Some(ExitOutcome::WaitFailed("exit watcher dropped".into())),
    };
    outcome.unwrap_or_else(|| ExitOutcome::WaitFailed("no exit status".into()))
}

/// Whole seconds, rounded up.
fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Turn captured output into the script's value: JSON when it parses,
/// otherwise the trimmed text.
pub(crate) fn parse_output(output: &str) -> Value {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    #[instrument(skip(self, request), fields(isolation_id = %id, script = %request.script_name))]
    async fn execute_with_id(&self, id: IsolationId, request: &IsolationRequest) -> ExecutionResult<Value> {
        let started = Instant::now();
        if self.closed.load(Ordering::SeqCst) {
            return ExecutionResult::failure(SandboxError::launch_msg("process backend is shut down"), id, None);
        }

        let limits = request.context.limits();
        let deadline = request
            .context
            .deadline()
            .unwrap_or_else(|| self.config.default_wall_time());
        let memory_mb = self.config.effective_memory_mb(limits.memory_mb());

        let scratch = match self.create_scratch(&id) {
            Ok(dir) => dir,
            Err(e) => return ExecutionResult::failure(e, id, None),
        };
        let scratch_path = scratch.path().to_path_buf();
        let mut cleanup = Cleanup {
            table: &self.active,
            id: id.clone(),
            pid: None,
            scratch: Some(scratch),
        };

        let script_path = match self.materialize(request, &scratch_path, memory_mb, deadline) {
            Ok(path) => path,
            Err(e) => return ExecutionResult::failure(e, id, None),
        };
        let workdir = request
            .context
            .working_directory
            .clone()
            .filter(|d| d.is_dir())
            .unwrap_or_else(|| scratch_path.clone());

        let mut cmd = self.build_command(request, &script_path, &workdir, memory_mb);
        debug!(runtime = %self.config.runtime.display(), memory_mb, deadline_ms = duration_ms(deadline), "Launching child");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = SandboxError::launch(format!("failed to spawn {}", self.config.runtime.display()), e);
                return ExecutionResult::failure(err, id, None);
            }
        };
        let pid = child.id();
        cleanup.pid = pid;

        let limit = request.eval.max_output_bytes.unwrap_or(self.config.max_output_bytes);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, limit));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, limit));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(Some(ExitOutcome::from(status)));
        });

        let live = Arc::new(LiveProcess {
            pid,
            started,
            exit: exit_rx.clone(),
            terminated: AtomicBool::new(false),
            sample: Mutex::new(ProcSample::default()),
        });
        self.active.write().insert(id.clone(), Arc::clone(&live));
        info!(pid = ?pid, "Process execution started");

        let sampler = {
            let live = Arc::clone(&live);
            let interval = self.config.sample_interval().max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                while !live.has_exited() {
                    live.refresh();
                    ticker.tick().await;
                }
            })
        };

        let mut timed_out = false;
        let outcome = if let Ok(outcome) = tokio::time::timeout(deadline, wait_for_exit(exit_rx.clone())).await {
            outcome
        } else {
            timed_out = true;
            warn!(deadline_ms = duration_ms(deadline), "Deadline exceeded, killing process group");
            if let Some(pid) = pid {
                signal_group(pid, GroupSignal::Kill);
            }
            tokio::time::timeout(KILL_WAIT, wait_for_exit(exit_rx))
                .await
                .unwrap_or(ExitOutcome::Signal(None))
        };
        sampler.abort();

        // Stragglers left in the group would hold the output pipes open.
        if let Some(pid) = pid {
            signal_group(pid, GroupSignal::Kill);
        }
        let output = collect_output(readers).await;
        let usage = live.snapshot();
        let monitor_reason = std::fs::read_to_string(scratch_path.join(VIOLATION_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        debug!(outcome = ?outcome, elapsed_ms = usage.wall_time_ms, "Child finished");

        let result = if timed_out {
            let err = SandboxError::violation(
                ViolationKind::ExecutionTimeout,
                &id,
                format!("exceeded wall-time limit of {}ms", duration_ms(deadline)),
            );
            ExecutionResult::failure(err, id, Some(usage))
        } else if stopped_on_request(live.terminated.load(Ordering::SeqCst), &outcome) {
            ExecutionResult::failure(SandboxError::Terminated(id.clone()), id, Some(usage))
        } else if let Some(recorded) = monitor_reason {
            let (kind, reason) = wrapper::parse_violation(&recorded);
            let err = SandboxError::violation(kind, &id, reason);
            ExecutionResult::failure(err, id, Some(usage))
        } else if let Some(reason) = memory_breach(&usage, memory_mb) {
            let err = SandboxError::violation(ViolationKind::ResourceLimitExceeded, &id, reason);
            ExecutionResult::failure(err, id, Some(usage))
        } else {
            classify(id, outcome, output, usage, started.elapsed())
        };

        drop(cleanup);
        result
    }

    async fn terminate_execution(&self, id: &IsolationId) -> bool {
        let Some(live) = self.active.read().get(id).cloned() else {
            return false;
        };
        if live.has_exited() {
            return false;
        }
        live.terminated.store(true, Ordering::SeqCst);
        // The child may have exited between the check and the flag.
        if live.has_exited() {
            live.terminated.store(false, Ordering::SeqCst);
            return false;
        }
        let Some(pid) = live.pid else {
            return true;
        };

        info!(isolation_id = %id, pid, "Terminating process execution");
        signal_group(pid, GroupSignal::Term);
        let grace = self.config.grace_period();
        match tokio::time::timeout(grace, wait_for_exit(live.exit.clone())).await {
            Ok(outcome) => stopped_on_request(true, &outcome),
            Err(_) => {
                warn!(isolation_id = %id, grace_ms = duration_ms(grace), "Grace window elapsed, forcing kill");
                signal_group(pid, GroupSignal::Kill);
                true
            }
        }
    }

    fn resource_usage(&self, id: &IsolationId) -> Option<ResourceUsageSnapshot> {
        let live = self.active.read().get(id).cloned()?;
        if !live.has_exited() {
            live.refresh();
        }
        Some(live.snapshot())
    }

    fn active_executions(&self) -> Vec<IsolationId> {
        self.active.read().keys().cloned().collect()
    }

    async fn cleanup(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids = self.active_executions();
        if !ids.is_empty() {
            info!(count = ids.len(), "Terminating remaining process executions");
        }
        for id in ids {
            self.terminate_execution(&id).await;
        }
    }
}

/// A clean exit wins over a termination request that arrived too late.
fn stopped_on_request(requested: bool, outcome: &ExitOutcome) -> bool {
    requested && *outcome != ExitOutcome::Code(0)
}

/// Parent-side check of the sampled peak against the memory ceiling.
fn memory_breach(usage: &ResourceUsageSnapshot, memory_mb: u64) -> Option<String> {
    let peak = usage.memory_bytes?;
    let ceiling = memory_mb.saturating_mul(1024 * 1024);
    (peak > ceiling).then(|| format!("peak memory of {peak} bytes exceeded the {memory_mb}MB ceiling"))
}

fn classify(
    id: IsolationId,
    outcome: ExitOutcome,
    output: String,
    usage: ResourceUsageSnapshot,
    elapsed: Duration,
) -> ExecutionResult<Value> {
    let err = match outcome {
        ExitOutcome::Code(0) => {
            return ExecutionResult::Success {
                value: parse_output(&output),
                isolation_id: id,
                usage,
                execution_time: elapsed,
            };
        }
        ExitOutcome::Code(1) => SandboxError::violation(
            ViolationKind::MaliciousCodeDetected,
            &id,
            "in-process monitor stopped the script",
        ),
        ExitOutcome::Code(2) => SandboxError::Script {
            message: "script exited with status 2".to_string(),
            exit_code: Some(2),
            output,
        },
        ExitOutcome::Code(code) => SandboxError::UnexpectedExit {
            exit_code: Some(code),
            output,
        },
        ExitOutcome::Signal(signal) => {
            debug!(signal = ?signal, "Child killed by signal");
            SandboxError::UnexpectedExit { exit_code: None, output }
        }
        ExitOutcome::WaitFailed(message) => SandboxError::launch_msg(format!("could not wait for child: {message}")),
    };
    ExecutionResult::failure(err, id, Some(usage))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{ExecutionContext, IsolationLevel, ResourceLimits};

    fn backend() -> ProcessBackend {
        ProcessBackend::new(ProcessConfig {
            grace_period_ms: 500,
            ..ProcessConfig::default()
        })
    }

    fn request(script: &str) -> IsolationRequest {
        IsolationRequest::new(script, "test script")
            .with_context(ExecutionContext::default().with_level(IsolationLevel::Process))
    }

    fn with_wall_ms(script: &str, ms: i64) -> IsolationRequest {
        IsolationRequest::new(script, "slow").with_context(
            ExecutionContext::default()
                .with_level(IsolationLevel::Process)
                .with_limits(ResourceLimits::default().with_wall_time_ms(ms)),
        )
    }

    #[test]
    fn filters_environment_by_prefix_and_deny_list() {
        let env = HashMap::from([
            ("PIPELINE_A".to_string(), "1".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
            ("USER_X".to_string(), "y".to_string()),
            ("SECRET".to_string(), "z".to_string()),
        ]);
        let allow = vec!["PIPELINE_".to_string(), "USER_".to_string(), "PATH".to_string()];
        let deny = vec!["PATH".to_string()];

        let filtered = filter_environment(&env, &allow, &deny);
        let expected = BTreeMap::from([
            ("PIPELINE_A".to_string(), "1".to_string()),
            ("USER_X".to_string(), "y".to_string()),
        ]);
        assert_eq!(filtered, expected);
    }

    #[test]
    fn output_is_parsed_as_json_when_possible() {
        assert_eq!(parse_output("4\n"), serde_json::json!(4));
        assert_eq!(parse_output(" [1, 2] "), serde_json::json!([1, 2]));
        assert_eq!(parse_output("hello world\n"), serde_json::json!("hello world"));
        assert_eq!(parse_output("\n"), Value::Null);
    }

    #[tokio::test]
    async fn successful_script_returns_output_value() {
        let backend = backend();
        let result = backend.execute_in_sandbox(&request("echo 4")).await;
        match result {
            ExecutionResult::Success { value, usage, .. } => {
                assert_eq!(value, serde_json::json!(4));
                assert!(usage.files_accessed.is_none());
            }
            ExecutionResult::Failure { reason, .. } => panic!("unexpected failure: {reason}"),
        }
        assert!(backend.active_executions().is_empty());
    }

    #[tokio::test]
    async fn stderr_is_part_of_the_output() {
        let result = backend().execute_in_sandbox(&request("echo oops >&2")).await;
        assert_eq!(result.value(), Some(&serde_json::json!("oops")));
    }

    #[tokio::test]
    async fn exit_codes_follow_the_contract() {
        let backend = backend();

        let result = backend.execute_in_sandbox(&request("exit 2")).await;
        assert!(matches!(result.error(), Some(SandboxError::Script { exit_code: Some(2), .. })));

        // A script's own status 1 is a script error, not a monitor trip.
        let result = backend.execute_in_sandbox(&request("echo failing; exit 1")).await;
        assert!(matches!(result.error(), Some(SandboxError::Script { .. })));

        let result = backend.execute_in_sandbox(&request("echo odd; exit 7")).await;
        match result.error() {
            Some(SandboxError::UnexpectedExit { exit_code, output }) => {
                assert_eq!(*exit_code, Some(7));
                assert!(output.contains("odd"));
            }
            other => panic!("expected unexpected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn denied_command_trips_the_monitor() {
        let result = backend().execute_in_sandbox(&request("sudo id")).await;
        assert_eq!(result.violation_kind(), Some(ViolationKind::MaliciousCodeDetected));
        if let ExecutionResult::Failure { reason, .. } = &result {
            assert!(reason.contains("sudo"), "{reason}");
        }
    }

    #[tokio::test]
    async fn unsetting_or_bypassing_shadowed_commands_still_trips() {
        let backend = backend();
        for script in [
            "unset -f mount; mount >/dev/null; echo escaped",
            "command sudo id; echo escaped",
            "\\su root -c id; echo escaped",
        ] {
            let result = backend.execute_in_sandbox(&request(script)).await;
            assert_eq!(result.violation_kind(), Some(ViolationKind::MaliciousCodeDetected), "{script}");
            assert!(!result.is_success());
        }
        assert!(backend.active_executions().is_empty());
    }

    #[tokio::test]
    async fn stray_braces_cannot_escape_the_wrapper() {
        let script = "}\nsudo() { :; }\nsudo id\necho escaped";
        let result = backend().execute_in_sandbox(&request(script)).await;
        assert!(!result.is_success());
        match result.error() {
            Some(SandboxError::Script { output, .. }) => assert!(!output.contains("escaped"), "{output}"),
            other => panic!("expected a script error, got {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn child_cannot_gain_privileges() {
        let script = "awk '/^NoNewPrivs/ { print $2 }' /proc/self/status";
        let result = backend().execute_in_sandbox(&request(script)).await;
        assert_eq!(result.value(), Some(&serde_json::json!(1)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn memory_ceiling_breach_is_a_resource_violation() {
        let req = IsolationRequest::new("x=$(head -c 300000000 /dev/zero | tr '\\0' a); echo done", "hog").with_context(
            ExecutionContext::default()
                .with_level(IsolationLevel::Process)
                .with_limits(ResourceLimits::default().with_memory_mb(64)),
        );
        let result = backend().execute_in_sandbox(&req).await;
        assert_eq!(result.violation_kind(), Some(ViolationKind::ResourceLimitExceeded));
        if let ExecutionResult::Failure { reason, .. } = &result {
            assert!(reason.contains("memory"), "{reason}");
        }
    }

    #[test]
    fn sampled_peak_above_ceiling_is_a_breach() {
        let mut usage = ResourceUsageSnapshot::wall_only(Duration::from_millis(5));
        assert_eq!(memory_breach(&usage, 64), None);
        usage.memory_bytes = Some(64 * 1024 * 1024);
        assert_eq!(memory_breach(&usage, 64), None);
        usage.memory_bytes = Some(64 * 1024 * 1024 + 1);
        assert!(memory_breach(&usage, 64).is_some_and(|r| r.contains("64MB")));
    }

    #[test]
    fn clean_exit_wins_over_late_termination() {
        assert!(!stopped_on_request(true, &ExitOutcome::Code(0)));
        assert!(stopped_on_request(true, &ExitOutcome::Signal(Some(15))));
        assert!(stopped_on_request(true, &ExitOutcome::Code(143)));
        assert!(!stopped_on_request(false, &ExitOutcome::Signal(Some(9))));
    }

    #[tokio::test]
    async fn terminating_an_exited_child_is_a_no_op() {
        let backend = backend();
        let id = IsolationId::from("already-done");
        let (_tx, exit) = watch::channel(Some(ExitOutcome::Code(0)));
        let live = Arc::new(LiveProcess {
            pid: None,
            started: Instant::now(),
            exit,
            terminated: AtomicBool::new(false),
            sample: Mutex::new(ProcSample::default()),
        });
        backend.active.write().insert(id.clone(), Arc::clone(&live));

        assert!(!backend.terminate_execution(&id).await);
        assert!(!live.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn deadline_kills_spinning_script() {
        let backend = backend();
        let started = Instant::now();
        let result = backend.execute_in_sandbox(&with_wall_ms("while :; do :; done", 200)).await;
        let elapsed = started.elapsed();

        assert_eq!(result.violation_kind(), Some(ViolationKind::ExecutionTimeout));
        let usage = result.usage().cloned().unwrap();
        assert!(usage.wall_time_ms >= 200);
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
        assert!(backend.active_executions().is_empty());
    }

    #[tokio::test]
    async fn environment_is_filtered_in_the_child() {
        let ctx = ExecutionContext::default()
            .with_level(IsolationLevel::Process)
            .with_env("PIPELINE_A", "1")
            .with_env("USER_X", "y")
            .with_env("SECRET", "z")
            .with_env("PATH", "/bin");
        let req = IsolationRequest::new(
            r#"echo "${PIPELINE_A:-unset} ${USER_X:-unset} ${SECRET:-unset}""#,
            "env",
        )
        .with_context(ctx);

        let result = backend().execute_in_sandbox(&req).await;
        assert_eq!(result.value(), Some(&serde_json::json!("1 y unset")));
    }

    #[tokio::test]
    async fn bindings_are_visible_to_the_script() {
        let req = IsolationRequest::new(r#"echo "$stage""#, "bindings").with_context(
            ExecutionContext::default().with_binding("stage", serde_json::json!("deploy")),
        );
        let result = backend().execute_in_sandbox(&req).await;
        assert_eq!(result.value(), Some(&serde_json::json!("deploy")));
    }

    #[tokio::test]
    async fn scratch_directory_is_removed() {
        let result = backend().execute_in_sandbox(&request("pwd")).await;
        let dir = result.value().and_then(Value::as_str).map(PathBuf::from).unwrap();
        assert!(dir.to_string_lossy().contains("process-test_script-"));
        assert!(!dir.exists(), "{} still exists", dir.display());
    }

    #[tokio::test]
    async fn missing_runtime_is_a_launch_failure() {
        let root = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(ProcessConfig {
            runtime: PathBuf::from("/nonexistent/bin/sh"),
            temp_root: Some(root.path().to_path_buf()),
            ..ProcessConfig::default()
        });
        let result = backend.execute_in_sandbox(&request("echo hi")).await;
        assert!(matches!(result.error(), Some(SandboxError::Launch { .. })));
        assert!(backend.active_executions().is_empty());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_inert() {
        let backend = backend();
        let id = IsolationId::from("does-not-exist");
        assert!(!backend.terminate_execution(&id).await);
        assert!(backend.resource_usage(&id).is_none());
        assert!(backend.active_executions().is_empty());
    }

    #[tokio::test]
    async fn terminate_stops_running_script() {
        let backend = Arc::new(backend());
        let runner = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.execute_in_sandbox(&request("sleep 30")).await })
        };

        let id = loop {
            if let Some(id) = backend.active_executions().pop() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(backend.resource_usage(&id).is_some());
        assert!(backend.terminate_execution(&id).await);

        let result = tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
        assert!(matches!(result.error(), Some(SandboxError::Terminated(_))));
        assert!(backend.resource_usage(&id).is_none());
        assert!(!backend.terminate_execution(&id).await);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_closes_backend() {
        let backend = backend();
        backend.cleanup().await;
        backend.cleanup().await;
        let result = backend.execute_in_sandbox(&request("echo hi")).await;
        assert!(matches!(result.error(), Some(SandboxError::Launch { .. })));
    }
}
