//! Single entry point for secure script execution.
//!
//! The manager validates policy, picks a backend, races it against the
//! wall-clock deadline and tracks every in-flight execution under its own
//! key until the execution has been cleaned up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendKind, InterpreterBackend, IsolationBackend, ProcessBackend};
use crate::config::{PolicyConfig, SandboxConfig};
use crate::error::{SandboxError, ViolationKind};
use crate::policy::{PolicyValidator, ValidationReport};
use crate::types::{
    duration_ms, ExecutionContext, ExecutionKey, ExecutionResult, IsolationId, IsolationLevel, IsolationRequest,
    ResourceUsageSnapshot,
};

/// Bookkeeping for one logical execution.
#[derive(Debug, Clone)]
struct Tracked {
    backend: BackendKind,
    isolation_id: IsolationId,
    script_name: String,
    started: Instant,
    /// Set once the backend has registered the isolation id.
    published: bool,
}

/// Point-in-time description of a tracked execution.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecution {
    pub key: ExecutionKey,
    pub backend: BackendKind,
    pub isolation_id: IsolationId,
    pub script_name: String,
    pub usage: ResourceUsageSnapshot,
}

type ExecutionTable = RwLock<HashMap<ExecutionKey, Tracked>>;

type RunFuture<'a> = Pin<Box<dyn Future<Output = ExecutionResult<Value>> + Send + 'a>>;

/// Removes the tracking entry however the execution ends.
struct TrackingGuard<'a> {
    table: &'a ExecutionTable,
    key: ExecutionKey,
}

impl Drop for TrackingGuard<'_> {
    fn drop(&mut self) {
        if self.table.write().remove(&self.key).is_some() {
            debug!(key = %self.key, "Execution untracked");
        }
    }
}

/// Entry point that runs scripts under policy, deadline and isolation.
pub struct SandboxManager {
    validator: PolicyValidator,
    backends: HashMap<BackendKind, Arc<dyn IsolationBackend>>,
    executions: ExecutionTable,
    shut_down: AtomicBool,
}

impl SandboxManager {
    /// Create a manager with the built-in process and interpreter backends.
    pub fn new(config: SandboxConfig) -> Self {
        let process: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new(config.process));
        let interpreter: Arc<dyn IsolationBackend> = Arc::new(InterpreterBackend::new(config.interpreter));
        Self::with_backends(config.policy, [process, interpreter])
    }

    /// Create a manager over explicit backends, keyed by their kind. A later
    /// backend of the same kind replaces an earlier one.
    pub fn with_backends(
        policy: PolicyConfig,
        backends: impl IntoIterator<Item = Arc<dyn IsolationBackend>>,
    ) -> Self {
        let backends = backends.into_iter().map(|b| (b.kind(), b)).collect();
        Self {
            validator: PolicyValidator::new(policy),
            backends,
            executions: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Check a context against policy without running anything.
    pub fn validate_security_policy(&self, context: &ExecutionContext) -> ValidationReport {
        self.validator.validate(context)
    }

    /// Run `request` under a fresh execution key.
    pub async fn execute_securely<T: DeserializeOwned>(&self, request: &IsolationRequest) -> ExecutionResult<T> {
        self.execute_with_key(ExecutionKey::generate(&request.script_name), request)
            .await
    }

    /// Run `request` under a caller-chosen key, so it can be terminated or
    /// sampled while running.
    #[instrument(skip_all, fields(key = %key, script = %request.script_name))]
    pub async fn execute_with_key<T: DeserializeOwned>(
        &self,
        key: ExecutionKey,
        request: &IsolationRequest,
    ) -> ExecutionResult<T> {
        let name = &request.script_name;
        if self.shut_down.load(Ordering::SeqCst) {
            return ExecutionResult::failure(SandboxError::Shutdown, IsolationId::generate("manager", name), None);
        }

        let report = self.validator.validate(&request.context);
        if !report.is_valid() {
            warn!(issues = report.issues.len(), summary = %report.summary(), "Policy rejected execution");
            return ExecutionResult::failure(
                SandboxError::PolicyRejected(report),
                IsolationId::generate("policy", name),
                None,
            );
        }

        let level = request.context.isolation_level;
        let Some(backend) = self.select_backend(level) else {
            let err = SandboxError::launch_msg(format!(
                "no backend available for isolation level {}",
                level.map_or("default", IsolationLevel::as_str)
            ));
            return ExecutionResult::failure(err, IsolationId::generate("manager", name), None);
        };

        let id = backend.allocate_id(name);
        let deadline = self.deadline_for(&request.context);
        let started = Instant::now();
        {
            let mut executions = self.executions.write();
            if executions.contains_key(&key) {
                drop(executions);
                let err = SandboxError::launch_msg(format!("execution key {key} is already in use"));
                return ExecutionResult::failure(err, id, None);
            }
            executions.insert(
                key.clone(),
                Tracked {
                    backend: backend.kind(),
                    isolation_id: id.clone(),
                    script_name: name.clone(),
                    started,
                    published: false,
                },
            );
        }
        let _tracking = TrackingGuard {
            table: &self.executions,
            key: key.clone(),
        };
        info!(
            isolation_id = %id,
            backend = %backend.kind(),
            deadline_ms = duration_ms(deadline),
            "Dispatching execution"
        );

        let mut run = backend.execute_with_id(id.clone(), request);
        // Backends register the id before their first suspension point, so
        // after one poll the key can be terminated and sampled.
        let first = std::future::poll_fn(|cx| Poll::Ready(run.as_mut().poll(cx))).await;
        let result = match first {
            Poll::Ready(result) => result,
            Poll::Pending => {
                if let Some(tracked) = self.executions.write().get_mut(&key) {
                    tracked.published = true;
                }
                self.race_deadline(backend.as_ref(), &id, run, deadline, started).await
            }
        };

        match &result {
            ExecutionResult::Success { execution_time, .. } => {
                info!(isolation_id = %id, elapsed_ms = duration_ms(*execution_time), "Execution completed");
            }
            ExecutionResult::Failure { reason, .. } => {
                let kind = result.violation_kind().map(ViolationKind::as_str);
                warn!(isolation_id = %id, violation = ?kind, reason = %reason, "Execution failed");
            }
        }
        convert(result)
    }

    /// Drive `run` to completion. Past `deadline` the backend is asked to
    /// terminate while `run` keeps being polled, so the backend's own
    /// enforcement can still finish it first.
    async fn race_deadline(
        &self,
        backend: &dyn IsolationBackend,
        id: &IsolationId,
        mut run: RunFuture<'_>,
        deadline: Duration,
        started: Instant,
    ) -> ExecutionResult<Value> {
        tokio::select! {
            result = &mut run => return result,
            () = tokio::time::sleep_until((started + deadline).into()) => {}
        }
        warn!(isolation_id = %id, deadline_ms = duration_ms(deadline), "Manager deadline reached, terminating");
        let stop = backend.terminate_execution(id);
        tokio::pin!(stop);
        // Backend cleanup completes before the timeout is reported.
        let finished = tokio::select! {
            result = &mut run => result,
            _ = &mut stop => run.await,
        };
        if finished.violation_kind() == Some(ViolationKind::ExecutionTimeout) {
            return finished;
        }
        let elapsed_ms = duration_ms(started.elapsed());
        let mut usage = finished
            .usage()
            .cloned()
            .unwrap_or_else(|| ResourceUsageSnapshot::wall_only(started.elapsed()));
        usage.wall_time_ms = usage.wall_time_ms.max(elapsed_ms);
        let err = SandboxError::violation(
            ViolationKind::ExecutionTimeout,
            id,
            format!("manager deadline of {}ms exceeded", duration_ms(deadline)),
        );
        ExecutionResult::failure(err, id.clone(), Some(usage))
    }

    /// Terminate a tracked execution. `false` for unknown or finished keys.
    pub async fn terminate_execution(&self, key: &ExecutionKey) -> bool {
        let Some((backend, id)) = self.lookup(key) else {
            debug!(key = %key, "Terminate requested for unknown execution");
            return false;
        };
        info!(key = %key, isolation_id = %id, "Terminating execution");
        backend.terminate_execution(&id).await
    }

    /// Usage of a tracked execution, or `None` once it has been cleaned up.
    pub fn get_resource_usage(&self, key: &ExecutionKey) -> Option<ResourceUsageSnapshot> {
        let tracked = self.executions.read().get(key).filter(|t| t.published).cloned()?;
        Some(self.usage_of(&tracked))
    }

    /// Usage of every tracked execution at this instant.
    pub fn get_active_executions(&self) -> HashMap<ExecutionKey, ResourceUsageSnapshot> {
        self.active_execution_details()
            .into_iter()
            .map(|e| (e.key, e.usage))
            .collect()
    }

    /// Like [`get_active_executions`](Self::get_active_executions), with the
    /// backend and script name of each execution.
    pub fn active_execution_details(&self) -> Vec<ActiveExecution> {
        let tracked: Vec<(ExecutionKey, Tracked)> = self
            .executions
            .read()
            .iter()
            .filter(|(_, t)| t.published)
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        tracked
            .into_iter()
            .map(|(key, t)| ActiveExecution {
                usage: self.usage_of(&t),
                key,
                backend: t.backend,
                isolation_id: t.isolation_id,
                script_name: t.script_name,
            })
            .collect()
    }

    /// Terminate everything, then clean up each backend once. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return;
        }
        let keys: Vec<ExecutionKey> = self.executions.read().keys().cloned().collect();
        info!(active = keys.len(), "Shutting down sandbox manager");
        for key in &keys {
            self.terminate_execution(key).await;
        }

        for (kind, backend) in &self.backends {
            let backend = Arc::clone(backend);
            // A panicking backend must not stop the others from cleaning up.
            if let Err(e) = tokio::spawn(async move { backend.cleanup().await }).await {
                error!(backend = %kind, error = %e, "Backend cleanup failed");
            }
        }
        info!("Sandbox manager shut down");
    }

    fn select_backend(&self, level: Option<IsolationLevel>) -> Option<Arc<dyn IsolationBackend>> {
        let preferred = BackendKind::for_level(level);
        if let Some(backend) = self.backends.get(&preferred) {
            return Some(Arc::clone(backend));
        }
        if level.is_some() {
            return None;
        }
        [BackendKind::Interpreter, BackendKind::Process]
            .iter()
            .find_map(|kind| self.backends.get(kind))
            .map(Arc::clone)
    }

    fn deadline_for(&self, context: &ExecutionContext) -> Duration {
        context
            .deadline()
            .unwrap_or_else(|| self.validator.config().default_wall_time())
    }

    fn lookup(&self, key: &ExecutionKey) -> Option<(Arc<dyn IsolationBackend>, IsolationId)> {
        let tracked = self.executions.read().get(key).filter(|t| t.published).cloned()?;
        let backend = self.backends.get(&tracked.backend)?;
        Some((Arc::clone(backend), tracked.isolation_id))
    }

    fn usage_of(&self, tracked: &Tracked) -> ResourceUsageSnapshot {
        self.backends
            .get(&tracked.backend)
            .and_then(|b| b.resource_usage(&tracked.isolation_id))
            .unwrap_or_else(|| ResourceUsageSnapshot::wall_only(tracked.started.elapsed()))
    }
}

/// Map a backend's JSON value onto the caller's type, keeping metadata.
fn convert<T: DeserializeOwned>(result: ExecutionResult<Value>) -> ExecutionResult<T> {
    match result {
        ExecutionResult::Success {
            value,
            isolation_id,
            usage,
            execution_time,
        } => match decode(value) {
            Ok(value) => ExecutionResult::Success {
                value,
                isolation_id,
                usage,
                execution_time,
            },
            Err(message) => ExecutionResult::failure(SandboxError::ResultConversion(message), isolation_id, Some(usage)),
        },
        ExecutionResult::Failure {
            error,
            isolation_id,
            reason,
            usage,
        } => ExecutionResult::Failure {
            error,
            isolation_id,
            reason,
            usage,
        },
    }
}

/// Decode `value` as `T`, retrying with its string form before giving up.
fn decode<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    let text = match &value {
        Value::String(_) => None,
        other => Some(other.to_string()),
    };
    match serde_json::from_value(value) {
        Ok(decoded) => Ok(decoded),
        Err(first) => text
            .and_then(|t| serde_json::from_value(Value::String(t)).ok())
            .ok_or_else(|| first.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::types::ResourceLimits;

    struct MockBackend {
        kind: BackendKind,
        delay: Duration,
        value: Value,
        /// How long a terminate request takes to reach the run.
        terminate_delay: Duration,
        running: parking_lot::Mutex<HashMap<IsolationId, Arc<Notify>>>,
        terminations: AtomicUsize,
        cleanups: AtomicUsize,
    }

    impl MockBackend {
        fn new(kind: BackendKind, delay: Duration, value: Value) -> Arc<Self> {
            Self::slow_to_stop(kind, delay, value, Duration::ZERO)
        }

        fn slow_to_stop(kind: BackendKind, delay: Duration, value: Value, terminate_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                delay,
                value,
                terminate_delay,
                running: parking_lot::Mutex::new(HashMap::new()),
                terminations: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IsolationBackend for MockBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn execute_with_id(&self, id: IsolationId, _request: &IsolationRequest) -> ExecutionResult<Value> {
            let stop = Arc::new(Notify::new());
            self.running.lock().insert(id.clone(), Arc::clone(&stop));
            let result = tokio::select! {
                () = tokio::time::sleep(self.delay) => ExecutionResult::Success {
                    value: self.value.clone(),
                    isolation_id: id.clone(),
                    usage: ResourceUsageSnapshot::wall_only(self.delay),
                    execution_time: self.delay,
                },
                () = stop.notified() => ExecutionResult::failure(SandboxError::Terminated(id.clone()), id.clone(), None),
            };
            self.running.lock().remove(&id);
            result
        }

        async fn terminate_execution(&self, id: &IsolationId) -> bool {
            let Some(stop) = self.running.lock().get(id).cloned() else {
                return false;
            };
            self.terminations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.terminate_delay).await;
            stop.notify_one();
            true
        }

        fn resource_usage(&self, id: &IsolationId) -> Option<ResourceUsageSnapshot> {
            self.running
                .lock()
                .contains_key(id)
                .then(|| ResourceUsageSnapshot::wall_only(Duration::from_millis(1)))
        }

        fn active_executions(&self) -> Vec<IsolationId> {
            self.running.lock().keys().cloned().collect()
        }

        async fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(delay: Duration, value: Value) -> (SandboxManager, Arc<MockBackend>, Arc<MockBackend>) {
        let process = MockBackend::new(BackendKind::Process, delay, value.clone());
        let interpreter = MockBackend::new(BackendKind::Interpreter, delay, value);
        let backends: [Arc<dyn IsolationBackend>; 2] = [process.clone(), interpreter.clone()];
        (SandboxManager::with_backends(PolicyConfig::default(), backends), process, interpreter)
    }

    fn request(level: Option<IsolationLevel>) -> IsolationRequest {
        let mut context = ExecutionContext::default();
        context.isolation_level = level;
        IsolationRequest::new("return 2+2", "unit").with_context(context)
    }

    #[tokio::test]
    async fn returns_typed_value() {
        let (manager, _, _) = manager(Duration::ZERO, json!(4));
        let result: ExecutionResult<i64> = manager.execute_securely(&request(None)).await;
        assert_eq!(tokio_test::assert_ok!(result.into_result()), 4);
        assert!(manager.get_active_executions().is_empty());
    }

    #[tokio::test]
    async fn selects_backend_by_level() {
        let (manager, _, _) = manager(Duration::ZERO, json!(null));
        let result: ExecutionResult<Value> = manager
            .execute_securely(&request(Some(IsolationLevel::Process)))
            .await;
        assert!(result.isolation_id().as_str().starts_with("process-unit-"));

        for level in [None, Some(IsolationLevel::Trusted), Some(IsolationLevel::Isolated)] {
            let result: ExecutionResult<Value> = manager.execute_securely(&request(level)).await;
            assert!(result.isolation_id().as_str().starts_with("interpreter-unit-"), "{level:?}");
        }
    }

    #[tokio::test]
    async fn missing_backend_is_a_launch_failure_unless_level_is_absent() {
        let process = MockBackend::new(BackendKind::Process, Duration::ZERO, json!(1));
        let backends: [Arc<dyn IsolationBackend>; 1] = [process];
        let manager = SandboxManager::with_backends(PolicyConfig::default(), backends);

        let result: ExecutionResult<Value> = manager
            .execute_securely(&request(Some(IsolationLevel::Isolated)))
            .await;
        assert!(matches!(result.error(), Some(SandboxError::Launch { .. })));

        let result: ExecutionResult<Value> = manager.execute_securely(&request(None)).await;
        assert_eq!(result.value(), Some(&json!(1)));
    }

    #[tokio::test]
    async fn values_fall_back_to_their_string_form() {
        let (manager, _, _) = manager(Duration::ZERO, json!(4));
        let result: ExecutionResult<String> = manager.execute_securely(&request(None)).await;
        assert_eq!(result.value().map(String::as_str), Some("4"));
    }

    #[tokio::test]
    async fn unconvertible_values_fail_with_conversion_error() {
        let (manager, _, _) = manager(Duration::ZERO, json!({"a": 1}));
        let result: ExecutionResult<i64> = manager.execute_securely(&request(None)).await;
        assert!(matches!(result.error(), Some(SandboxError::ResultConversion(_))));
        assert!(result.usage().is_some());
    }

    #[tokio::test]
    async fn policy_rejection_happens_before_dispatch() {
        let (manager, process, interpreter) = manager(Duration::ZERO, json!(1));
        let req = IsolationRequest::new("x", "greedy")
            .with_context(ExecutionContext::default().with_limits(ResourceLimits::default().with_memory_mb(1 << 20)));
        let result: ExecutionResult<Value> = manager.execute_securely(&req).await;

        assert_eq!(result.violation_kind(), Some(ViolationKind::ResourceLimitExceeded));
        assert!(matches!(result.error(), Some(SandboxError::PolicyRejected(_))));
        assert!(process.active_executions().is_empty() && interpreter.active_executions().is_empty());
    }

    #[tokio::test]
    async fn manager_deadline_terminates_backend() {
        let (manager, _, interpreter) = manager(Duration::from_secs(5), json!(1));
        let req = IsolationRequest::new("spin", "slow")
            .with_context(ExecutionContext::default().with_timeout(Duration::from_millis(100)));

        let started = Instant::now();
        let result: ExecutionResult<Value> = manager.execute_securely(&req).await;
        assert_eq!(result.violation_kind(), Some(ViolationKind::ExecutionTimeout));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(interpreter.terminations.load(Ordering::SeqCst), 1);
        assert!(interpreter.active_executions().is_empty());
        assert!(manager.get_active_executions().is_empty());
    }

    #[tokio::test]
    async fn slow_termination_does_not_extend_the_deadline() {
        // Stops on its own after 300ms, but takes 5s to honour a terminate.
        let backend = MockBackend::slow_to_stop(
            BackendKind::Interpreter,
            Duration::from_millis(300),
            json!(1),
            Duration::from_secs(5),
        );
        let backends: [Arc<dyn IsolationBackend>; 1] = [backend.clone()];
        let manager = SandboxManager::with_backends(PolicyConfig::default(), backends);
        let req = IsolationRequest::new("spin", "stubborn")
            .with_context(ExecutionContext::default().with_timeout(Duration::from_millis(100)));

        let started = Instant::now();
        let result: ExecutionResult<Value> = manager.execute_securely(&req).await;
        let elapsed = started.elapsed();
        assert_eq!(result.violation_kind(), Some(ViolationKind::ExecutionTimeout));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert!(result.usage().is_some_and(|u| u.wall_time_ms >= 100));
        assert_eq!(backend.terminations.load(Ordering::SeqCst), 1);
        assert!(manager.get_active_executions().is_empty());
    }

    #[tokio::test]
    async fn terminate_by_key() {
        let (manager, _, _) = manager(Duration::from_secs(5), json!(1));
        let manager = Arc::new(manager);
        let key = ExecutionKey::from("exec-under-test");

        let runner = {
            let manager = Arc::clone(&manager);
            let key = key.clone();
            tokio::spawn(async move {
                manager
                    .execute_with_key::<Value>(key, &request(Some(IsolationLevel::Process)))
                    .await
            })
        };
        while manager.get_resource_usage(&key).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let details = manager.active_execution_details();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].backend, BackendKind::Process);

        assert!(manager.terminate_execution(&key).await);
        let result = runner.await.unwrap();
        assert!(matches!(result.error(), Some(SandboxError::Terminated(_))));
        assert!(!manager.terminate_execution(&key).await);
        assert!(manager.get_resource_usage(&key).is_none());
    }

    #[tokio::test]
    async fn unknown_key_is_inert() {
        let (manager, _, _) = manager(Duration::ZERO, json!(1));
        let key = ExecutionKey::from("does-not-exist");
        assert!(!manager.terminate_execution(&key).await);
        assert!(manager.get_resource_usage(&key).is_none());
        assert!(manager.get_active_executions().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cleans_each_backend_once() {
        let (manager, process, interpreter) = manager(Duration::ZERO, json!(1));
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(process.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(interpreter.cleanups.load(Ordering::SeqCst), 1);

        let result: ExecutionResult<Value> = manager.execute_securely(&request(None)).await;
        assert!(matches!(result.error(), Some(SandboxError::Shutdown)));
    }
}
