//! In-process interpreter backend on embedded V8.
//!
//! V8 isolates are `!Send`, so every execution gets a fresh `JsRuntime` on a
//! dedicated OS thread and reports back over a oneshot channel. Capability
//! scoping happens in a per-tier bootstrap script that runs before the user
//! script; attempts to reach a withheld capability throw and are recorded in
//! a closure-private audit list, so catching the error does not hide them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::process::parse_output;
use super::translate::translate_pipeline_script;
use super::{BackendKind, IsolationBackend};
use crate::config::InterpreterConfig;
use crate::error::{SandboxError, ViolationKind};
use crate::types::{
    duration_ms, ExecutionResult, IsolationId, IsolationLevel, IsolationRequest, ResourceUsageSnapshot,
    ScriptDialect,
};

/// Prefix of every error thrown by a capability trap.
const DENIED_MARKER: &str = "__SANDBOX_DENIED__";

/// Globals replaced by trapping accessors in every tier.
const TRAPPED_GLOBALS: &[(&str, &str)] = &[
    ("system", "Deno"),
    ("system", "process"),
    ("system", "java"),
    ("system", "Java"),
    ("system", "Packages"),
    ("system", "Worker"),
    ("system", "SharedArrayBuffer"),
    ("file", "require"),
    ("file", "readFile"),
    ("file", "writeFile"),
    ("file", "File"),
    ("network", "fetch"),
    ("network", "XMLHttpRequest"),
    ("network", "WebSocket"),
    ("network", "EventSource"),
];

const BOOTSTRAP: &str = r#"(config) => {
    "use strict";
    const g = globalThis;
    const defineProperty = Object.defineProperty;
    const freeze = Object.freeze;
    const create = Object.create;
    const keys = Object.keys;
    const stringify = JSON.stringify;
    const StringCtor = String;
    const ErrorCtor = Error;
    const ProxyCtor = Proxy;

    const denied = create(null);
    let deniedCount = 0;
    let out = "";
    let truncated = false;
    let ran = false;
    let returned = false;
    let okJson = "null";
    let errorText = null;

    const deny = (category, name) => {
        const entry = category + ":" + name;
        denied[deniedCount] = entry;
        deniedCount += 1;
        return new ErrorCtor("__SANDBOX_DENIED__ " + entry);
    };
    const trap = (category, name) => {
        try { delete g[name]; } catch (_) {}
        try {
            defineProperty(g, name, {
                configurable: false,
                enumerable: false,
                get() { throw deny(category, name); },
                set(_) { throw deny(category, name); },
            });
        } catch (_) {}
    };
    const constant = (name, value) => {
        defineProperty(g, name, { value, writable: false, configurable: false, enumerable: false });
    };

    const print = (...args) => {
        if (!config.capture) return;
        let line = "";
        for (let i = 0; i < args.length; i++) {
            let piece;
            try { piece = StringCtor(args[i]); } catch (_) { piece = "[unprintable]"; }
            line += (i > 0 ? " " : "") + piece;
        }
        line += "\n";
        const room = config.maxOutput - out.length;
        if (line.length > room) {
            truncated = true;
            line = room > 0 ? line.substring(0, room) : "";
        }
        out += line;
    };

    const bindings = config.bindings;
    for (const name of keys(bindings)) {
        try { g[name] = bindings[name]; } catch (_) {}
    }
    defineProperty(g, "print", { value: print, writable: true, configurable: true, enumerable: false });
    defineProperty(g, "println", { value: print, writable: true, configurable: true, enumerable: false });

    const members = create(null);
    members.env = freeze(config.env);
    members.workingDirectory = config.workingDirectory;
    members.print = print;
    if (config.tier === "trusted") {
        constant("host", freeze({
            env: members.env,
            workingDirectory: members.workingDirectory,
            print,
        }));
    } else if (config.tier === "constrained") {
        const allowed = create(null);
        for (const name of config.allowed) {
            if (name in members) allowed[name] = members[name];
        }
        constant("host", new ProxyCtor(create(null), {
            get(_target, key) {
                if (typeof key !== "string") return undefined;
                if (key in allowed) return allowed[key];
                throw deny("system", "host." + key);
            },
            has(_target, key) { return typeof key === "string" && key in allowed; },
            set() { return false; },
            defineProperty() { return false; },
            deleteProperty() { return false; },
        }));
    } else {
        trap("system", "host");
    }

    for (const [category, name] of config.traps) {
        trap(category, name);
    }

    if (config.tier !== "trusted") {
        const ctors = [
            Function,
            (async function () {}).constructor,
            (function* () {}).constructor,
            (async function* () {}).constructor,
        ];
        for (const ctor of ctors) {
            defineProperty(ctor.prototype, "constructor", {
                value: undefined, configurable: false, writable: false,
            });
        }
        trap("system", "eval");
        trap("system", "Function");
    }

    constant("__sandboxRun", freeze((fn) => {
        ran = true;
        try {
            const value = fn();
            returned = value !== undefined;
            let encoded;
            try { encoded = stringify(value); } catch (_) { encoded = undefined; }
            if (typeof encoded !== "string") {
                let text;
                try { text = StringCtor(value); } catch (_) { text = "[unprintable]"; }
                encoded = returned ? stringify(text) : "null";
            }
            okJson = encoded;
            errorText = null;
        } catch (e) {
            let message;
            try {
                message = e instanceof ErrorCtor ? StringCtor(e.message) : StringCtor(e);
            } catch (_) {
                message = "uncaught exception";
            }
            errorText = message;
        }
    }));

    constant("__sandboxReport", freeze(() => {
        let list = "";
        for (let i = 0; i < deniedCount; i++) {
            list += (i > 0 ? "," : "") + stringify(denied[i]);
        }
        return '{"ran":' + ran
            + ',"returned":' + returned
            + ',"ok":' + okJson
            + ',"error":' + (errorText === null ? "null" : stringify(errorText))
            + ',"denied":[' + list + ']'
            + ',"out":' + stringify(out)
            + ',"truncated":' + truncated + "}";
    }));
}"#;

/// Capability profile of one interpreter context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterTier {
    /// Full `host` object and `eval`.
    Trusted,
    /// `host` limited to allow-listed members; no code generation.
    Constrained,
    /// No `host` at all; no code generation.
    Isolated,
}

impl InterpreterTier {
    /// Tier for a requested level. An absent level gets `Constrained`.
    pub const fn for_level(level: Option<IsolationLevel>) -> Self {
        match level {
            Some(IsolationLevel::Trusted) => Self::Trusted,
            Some(IsolationLevel::Constrained) | None => Self::Constrained,
            Some(IsolationLevel::Isolated | IsolationLevel::Process) => Self::Isolated,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Constrained => "constrained",
            Self::Isolated => "isolated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    HeapLimit,
    CpuBudget,
    WallClock,
    Terminated,
}

/// Shared view of one running context.
struct Slot {
    started: Instant,
    handle: Mutex<Option<v8::IsolateHandle>>,
    stop: Mutex<Option<StopReason>>,
    finished: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            handle: Mutex::new(None),
            stop: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    /// Record why the context is stopping (first reason wins) and terminate it.
    fn stop(&self, reason: StopReason) {
        {
            let mut stop = self.stop.lock();
            if stop.is_none() {
                *stop = Some(reason);
            }
        }
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.terminate_execution();
        }
    }

    fn stop_reason(&self) -> Option<StopReason> {
        *self.stop.lock()
    }
}

type SlotTable = Mutex<HashMap<IsolationId, Arc<Slot>>>;

/// Removes the slot and stops the context on every exit path, including a
/// dropped execution future.
struct SlotGuard<'a> {
    table: &'a SlotTable,
    id: IsolationId,
    slot: Arc<Slot>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.slot.finished.load(Ordering::SeqCst) {
            self.slot.stop(StopReason::Terminated);
        }
        self.table.lock().remove(&self.id);
        debug!(isolation_id = %self.id, "Interpreter context released");
    }
}

/// Everything the engine thread needs, owned.
struct Job {
    id: IsolationId,
    tier: InterpreterTier,
    script: String,
    bootstrap_config: String,
    heap_limit: usize,
    cpu_budget: Duration,
    wall_deadline: Duration,
    slot: Arc<Slot>,
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    ran: bool,
    #[serde(default)]
    returned: bool,
    #[serde(default)]
    ok: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    denied: Vec<String>,
    #[serde(default)]
    out: String,
    #[serde(default)]
    truncated: bool,
}

/// Backend that evaluates scripts in a fresh V8 isolate per execution.
pub struct InterpreterBackend {
    config: InterpreterConfig,
    active: SlotTable,
    closed: AtomicBool,
}

impl InterpreterBackend {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub const fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    fn bootstrap_config(&self, tier: InterpreterTier, request: &IsolationRequest) -> Result<String, SandboxError> {
        let ctx = &request.context;
        let traps: Vec<[&str; 2]> = TRAPPED_GLOBALS.iter().map(|(c, n)| [*c, *n]).collect();
        let config = serde_json::json!({
            "tier": tier.as_str(),
            "allowed": self.config.allowed_host_members,
            "env": ctx.environment,
            "workingDirectory": ctx.working_directory.as_ref().map(|d| d.to_string_lossy()),
            "bindings": ctx.bindings,
            "traps": traps,
            "maxOutput": request.eval.max_output_bytes.unwrap_or(self.config.max_output_bytes),
            "capture": request.eval.capture_output,
        });
        serde_json::to_string(&config)
            .map_err(|e| SandboxError::launch_msg(format!("failed to encode interpreter bootstrap: {e}")))
    }
}

#[async_trait]
impl IsolationBackend for InterpreterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    #[instrument(skip(self, request), fields(isolation_id = %id, script = %request.script_name))]
    async fn execute_with_id(&self, id: IsolationId, request: &IsolationRequest) -> ExecutionResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return ExecutionResult::failure(SandboxError::launch_msg("interpreter engine is closed"), id, None);
        }

        let tier = InterpreterTier::for_level(request.context.isolation_level);
        let limits = request.context.limits();
        let bootstrap_config = match self.bootstrap_config(tier, request) {
            Ok(config) => config,
            Err(e) => return ExecutionResult::failure(e, id, None),
        };
        let script = match request.compile.dialect {
            ScriptDialect::Native => request.script.clone(),
            ScriptDialect::Pipeline => translate_pipeline_script(&request.script),
        };

        let slot = Arc::new(Slot::new());
        self.active.lock().insert(id.clone(), Arc::clone(&slot));
        let _guard = SlotGuard {
            table: &self.active,
            id: id.clone(),
            slot: Arc::clone(&slot),
        };

        let job = Job {
            id: id.clone(),
            tier,
            script,
            bootstrap_config,
            heap_limit: self.config.heap_limit_bytes(limits.memory_mb()),
            cpu_budget: limits.cpu_time().unwrap_or_else(|| self.config.default_cpu_budget()),
            wall_deadline: request.context.deadline().unwrap_or_else(|| self.config.default_wall_time()),
            slot,
        };
        debug!(tier = tier.as_str(), heap_limit = job.heap_limit, "Starting interpreter context");

        // V8 isolates are !Send, run the whole lifecycle on a dedicated thread
        let (tx, rx) = tokio::sync::oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("sandbox-interpreter".to_string())
            .spawn(move || {
                let result = run_job(job);
                if tx.send(result).is_err() {
                    warn!("interpreter result receiver dropped before result was sent");
                }
            });
        if let Err(e) = spawned {
            return ExecutionResult::failure(SandboxError::launch("failed to start interpreter thread", e), id, None);
        }

        let result = rx.await.unwrap_or_else(|_| {
            ExecutionResult::failure(SandboxError::launch_msg("interpreter thread exited without a result"), id, None)
        });
        if result.is_success() {
            info!("Interpreter execution succeeded");
        } else if let ExecutionResult::Failure { reason, .. } = &result {
            info!(reason = %reason, "Interpreter execution failed");
        }
        result
    }

    async fn terminate_execution(&self, id: &IsolationId) -> bool {
        let Some(slot) = self.active.lock().get(id).cloned() else {
            return false;
        };
        if slot.finished.load(Ordering::SeqCst) {
            return false;
        }
        info!(isolation_id = %id, "Terminating interpreter context");
        // V8 termination is immediate, so there is no grace phase to wait out.
        slot.stop(StopReason::Terminated);
        true
    }

    fn resource_usage(&self, id: &IsolationId) -> Option<ResourceUsageSnapshot> {
        let slot = self.active.lock().get(id).cloned()?;
        Some(ResourceUsageSnapshot {
            threads: Some(1),
            ..ResourceUsageSnapshot::wall_only(slot.started.elapsed())
        })
    }

    fn active_executions(&self) -> Vec<IsolationId> {
        self.active.lock().keys().cloned().collect()
    }

    async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<(IsolationId, Arc<Slot>)> =
            self.active.lock().iter().map(|(id, slot)| (id.clone(), Arc::clone(slot))).collect();
        for (id, slot) in slots {
            debug!(isolation_id = %id, "Closing interpreter context");
            slot.stop(StopReason::Terminated);
        }
        info!("Interpreter engine closed");
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    slot: Arc<Slot>,
    triggered: AtomicBool,
}

/// Stops the context and grants 1MB so the termination can unwind.
#[allow(unsafe_code)]
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the boxed HeapLimitState in `run_job`, which is
    // declared before the runtime and therefore dropped after it. V8 only calls
    // this on the isolate's own thread while it is alive.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.slot.stop(StopReason::HeapLimit);
    }
    current_heap_limit + 1024 * 1024
}

fn run_job(job: Job) -> ExecutionResult<Value> {
    let started = Instant::now();
    let cpu_start = thread_cpu_time();

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => return ExecutionResult::failure(SandboxError::launch("failed to build interpreter runtime", e), job.id, None),
    };
    let _enter = rt.enter();

    // Declared before the runtime so it outlives it.
    #[allow(clippy::needless_late_init)]
    let heap_state;
    let mut runtime = JsRuntime::new(RuntimeOptions {
        create_params: Some(v8::CreateParams::default().heap_limits(0, job.heap_limit)),
        ..Default::default()
    });
    heap_state = Box::new(HeapLimitState {
        slot: Arc::clone(&job.slot),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        std::ptr::addr_of!(*heap_state).cast_mut().cast::<std::ffi::c_void>(),
    );

    let handle = runtime.v8_isolate().thread_safe_handle();
    *job.slot.handle.lock() = Some(handle.clone());
    if job.slot.stop_reason().is_some() {
        // Terminated before the handle existed.
        handle.terminate_execution();
    }

    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let watchdog = {
        let slot = Arc::clone(&job.slot);
        let (limit, reason) = if job.cpu_budget < job.wall_deadline {
            (job.cpu_budget, StopReason::CpuBudget)
        } else {
            (job.wall_deadline, StopReason::WallClock)
        };
        std::thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(limit) {
                slot.stop(reason);
            }
        })
    };

    let outcome = evaluate(&mut runtime, &job);

    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    job.slot.finished.store(true, Ordering::SeqCst);
    *job.slot.handle.lock() = None;

    let mut stats = v8::HeapStatistics::default();
    runtime.v8_isolate().get_heap_statistics(&mut stats);
    let usage = ResourceUsageSnapshot {
        wall_time_ms: duration_ms(started.elapsed()),
        memory_bytes: u64::try_from(stats.used_heap_size()).ok(),
        cpu_time_ms: cpu_start.zip(thread_cpu_time()).map(|(a, b)| duration_ms(b.saturating_sub(a))),
        threads: Some(1),
        files_accessed: Some(Vec::new()),
        network_endpoints: Some(Vec::new()),
    };
    drop(runtime);
    drop(heap_state);

    classify(&job, outcome, usage, started.elapsed())
}

/// Result of driving one context: the envelope when the audit report could be
/// read, plus the engine error if evaluation threw past the wrapper.
struct Evaluation {
    envelope: Option<Envelope>,
    engine_error: Option<String>,
}

fn evaluate(runtime: &mut JsRuntime, job: &Job) -> Evaluation {
    let bootstrap = format!("({BOOTSTRAP})({});", job.bootstrap_config);
    if let Err(e) = runtime.execute_script("[sandbox:bootstrap]", bootstrap) {
        return Evaluation {
            envelope: None,
            engine_error: Some(format!("bootstrap failed: {e}")),
        };
    }

    let wrapped = format!("__sandboxRun(function () {{\n{}\n}});", job.script);
    let engine_error = runtime
        .execute_script("[sandbox:script]", wrapped)
        .err()
        .map(|e| e.to_string());

    if job.slot.stop_reason().is_some() {
        return Evaluation {
            envelope: None,
            engine_error,
        };
    }

    let envelope = match runtime.execute_script("[sandbox:report]", "__sandboxReport()".to_string()) {
        Ok(global) => {
            let text = {
                let scope = &mut runtime.handle_scope();
                let local = v8::Local::new(scope, global);
                local.to_rust_string_lossy(scope)
            };
            match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(isolation_id = %job.id, error = %e, "Unreadable audit report");
                    None
                }
            }
        }
        Err(e) => {
            warn!(isolation_id = %job.id, error = %e, "Audit report unavailable");
            None
        }
    };
    Evaluation { envelope, engine_error }
}

fn classify(job: &Job, evaluation: Evaluation, usage: ResourceUsageSnapshot, elapsed: Duration) -> ExecutionResult<Value> {
    let id = job.id.clone();
    if let Some(reason) = job.slot.stop_reason() {
        let err = match reason {
            StopReason::HeapLimit => SandboxError::violation(
                ViolationKind::ResourceLimitExceeded,
                &id,
                format!("heap limit of {} bytes reached", job.heap_limit),
            ),
            StopReason::CpuBudget => SandboxError::violation(
                ViolationKind::ResourceLimitExceeded,
                &id,
                format!("CPU budget of {}ms exhausted", duration_ms(job.cpu_budget)),
            ),
            StopReason::WallClock => SandboxError::violation(
                ViolationKind::ExecutionTimeout,
                &id,
                format!("exceeded wall-time limit of {}ms", duration_ms(job.wall_deadline)),
            ),
            StopReason::Terminated => SandboxError::Terminated(id.clone()),
        };
        return ExecutionResult::failure(err, id, Some(usage));
    }

    let envelope = evaluation.envelope.unwrap_or_default();
    if let Some(first) = envelope.denied.first() {
        let kind = denied_kind(first);
        let err = SandboxError::violation(
            kind,
            &id,
            format!("{} tier denied access to {}", job.tier.as_str(), envelope.denied.join(", ")),
        );
        return ExecutionResult::failure(err, id, Some(usage));
    }

    let thrown = evaluation.engine_error.or(envelope.error);
    if let Some(message) = thrown {
        let err = SandboxError::violation(ViolationKind::MaliciousCodeDetected, &id, format!("script raised: {message}"));
        return ExecutionResult::failure(err, id, Some(usage));
    }

    if envelope.truncated {
        debug!(isolation_id = %id, "Printed output was truncated");
    }
    let value = if !envelope.ran {
        Value::Null
    } else if !envelope.returned && !envelope.out.is_empty() {
        parse_output(&envelope.out)
    } else {
        envelope.ok
    };
    ExecutionResult::Success {
        value,
        isolation_id: id,
        usage,
        execution_time: elapsed,
    }
}

/// Map an audit entry such as `network:fetch` onto its violation kind.
fn denied_kind(entry: &str) -> ViolationKind {
    match entry.split_once(':').map(|(category, _)| category) {
        Some("file") => ViolationKind::UnauthorizedFileAccess,
        Some("network") => ViolationKind::UnauthorizedNetworkAccess,
        _ => ViolationKind::UnauthorizedSystemAccess,
    }
}

#[cfg(target_os = "linux")]
fn thread_cpu_time() -> Option<Duration> {
    use nix::time::{clock_gettime, ClockId};

    clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID).ok().map(Duration::from)
}

#[cfg(not(target_os = "linux"))]
fn thread_cpu_time() -> Option<Duration> {
    None
}
