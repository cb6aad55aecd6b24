//! Request, identity, limit and result types shared by every backend.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SandboxError, ViolationKind};

/// Process-wide sequence shared by isolation ids and execution keys.
static SEQUENCE: AtomicU64 = AtomicU64::new(1);

const MAX_NAME_LEN: usize = 48;

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Reduce a script name to `[A-Za-z0-9_-]`, bounded in length.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .take(MAX_NAME_LEN)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "script".to_string()
    } else {
        cleaned
    }
}

/// Identifier of one execution inside a backend.
///
/// Format: `<backend>-<sanitized-name>-<unix-millis>-<seq>`. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IsolationId(String);

impl IsolationId {
    pub fn generate(backend: &str, script_name: &str) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        Self(format!(
            "{backend}-{}-{millis}-{}",
            sanitize_name(script_name),
            next_sequence()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsolationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IsolationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Manager-scoped key for a logical execution.
///
/// Distinct from [`IsolationId`] so several executions of the same script
/// name can be tracked side by side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionKey(String);

impl ExecutionKey {
    pub fn generate(script_name: &str) -> Self {
        Self(format!("exec-{}-{}", next_sequence(), sanitize_name(script_name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Requested sandbox strength, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// In-process interpreter with host access.
    Trusted,
    /// In-process interpreter limited to an allow-list of host members.
    Constrained,
    /// In-process interpreter with no host access at all.
    Isolated,
    /// Separate OS process with a scratch directory and filtered environment.
    Process,
}

impl IsolationLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Constrained => "constrained",
            Self::Isolated => "isolated",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trusted" => Ok(Self::Trusted),
            "constrained" => Ok(Self::Constrained),
            "isolated" => Ok(Self::Isolated),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown isolation level: {other}")),
        }
    }
}

/// Optional resource ceilings. `None` means "backend default", never
/// "unlimited".
///
/// Fields are signed so that negative inputs reach policy validation and get
/// reported instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub max_memory_mb: Option<i64>,
    #[serde(default)]
    pub max_cpu_time_ms: Option<i64>,
    #[serde(default)]
    pub max_wall_time_ms: Option<i64>,
    #[serde(default)]
    pub max_threads: Option<i64>,
    #[serde(default)]
    pub max_file_handles: Option<i64>,
}

impl ResourceLimits {
    #[must_use]
    pub const fn with_memory_mb(mut self, mb: i64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    #[must_use]
    pub const fn with_cpu_time_ms(mut self, ms: i64) -> Self {
        self.max_cpu_time_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn with_wall_time_ms(mut self, ms: i64) -> Self {
        self.max_wall_time_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn with_threads(mut self, threads: i64) -> Self {
        self.max_threads = Some(threads);
        self
    }

    /// Wall-time ceiling as a duration, ignoring non-positive values.
    pub fn wall_time(&self) -> Option<Duration> {
        positive_millis(self.max_wall_time_ms)
    }

    /// CPU-time ceiling as a duration, ignoring non-positive values.
    pub fn cpu_time(&self) -> Option<Duration> {
        positive_millis(self.max_cpu_time_ms)
    }

    /// Memory ceiling in MB, ignoring non-positive values.
    pub fn memory_mb(&self) -> Option<u64> {
        self.max_memory_mb.and_then(|mb| u64::try_from(mb).ok()).filter(|mb| *mb > 0)
    }
}

fn positive_millis(value: Option<i64>) -> Option<Duration> {
    value
        .and_then(|ms| u64::try_from(ms).ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Everything a script runs against, apart from its text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Named values made visible to the script.
    #[serde(default)]
    pub bindings: HashMap<String, Value>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    /// Wall-clock deadline for the whole execution.
    #[serde(default, with = "millis_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub isolation_level: Option<IsolationLevel>,
}

impl ExecutionContext {
    #[must_use]
    pub fn with_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Limits declared by the caller, or an empty set.
    pub fn limits(&self) -> ResourceLimits {
        self.resource_limits.clone().unwrap_or_default()
    }

    /// Wall-clock deadline: a non-zero `timeout`, else the wall-time limit.
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout
            .filter(|t| !t.is_zero())
            .or_else(|| self.resource_limits.as_ref().and_then(ResourceLimits::wall_time))
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Source language of the submitted script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptDialect {
    /// Already in the backend's native syntax.
    #[default]
    Native,
    /// Pipeline DSL syntax; the interpreter applies a best-effort rewrite.
    Pipeline,
}

/// Backend-specific compilation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileOptions {
    #[serde(default)]
    pub dialect: ScriptDialect,
}

/// Backend-specific evaluation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalOptions {
    /// Cap on captured output; backend default when absent.
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
    /// Whether printed output is kept and returned.
    #[serde(default = "default_true")]
    pub capture_output: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            max_output_bytes: None,
            capture_output: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Immutable input to one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationRequest {
    pub script: String,
    pub script_name: String,
    #[serde(default)]
    pub context: ExecutionContext,
    #[serde(default)]
    pub compile: CompileOptions,
    #[serde(default)]
    pub eval: EvalOptions,
}

impl IsolationRequest {
    pub fn new(script: impl Into<String>, script_name: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            script_name: script_name.into(),
            context: ExecutionContext::default(),
            compile: CompileOptions::default(),
            eval: EvalOptions::default(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub const fn with_dialect(mut self, dialect: ScriptDialect) -> Self {
        self.compile.dialect = dialect;
        self
    }

    #[must_use]
    pub const fn with_eval(mut self, eval: EvalOptions) -> Self {
        self.eval = eval;
        self
    }
}

/// Point-in-time resource metrics for one execution.
///
/// `wall_time_ms` is always measured. Every other field is `None` when the
/// backend cannot measure it, rather than a made-up zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsageSnapshot {
    pub wall_time_ms: u64,
    pub memory_bytes: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub threads: Option<u32>,
    pub files_accessed: Option<Vec<String>>,
    pub network_endpoints: Option<Vec<String>>,
}

impl ResourceUsageSnapshot {
    pub fn wall_only(elapsed: Duration) -> Self {
        Self {
            wall_time_ms: duration_ms(elapsed),
            ..Self::default()
        }
    }

    /// Names of the fields this snapshot could not measure.
    pub fn unmeasured_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.memory_bytes.is_none() {
            fields.push("memory_bytes");
        }
        if self.cpu_time_ms.is_none() {
            fields.push("cpu_time_ms");
        }
        if self.threads.is_none() {
            fields.push("threads");
        }
        if self.files_accessed.is_none() {
            fields.push("files_accessed");
        }
        if self.network_endpoints.is_none() {
            fields.push("network_endpoints");
        }
        fields
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of one execution. Exactly one variant is ever produced.
#[derive(Debug)]
pub enum ExecutionResult<T> {
    Success {
        value: T,
        isolation_id: IsolationId,
        usage: ResourceUsageSnapshot,
        execution_time: Duration,
    },
    Failure {
        error: SandboxError,
        isolation_id: IsolationId,
        reason: String,
        /// Final usage, when the execution got far enough to measure it.
        usage: Option<ResourceUsageSnapshot>,
    },
}

impl<T> ExecutionResult<T> {
    /// Build a failure whose reason is the error's display text.
    pub fn failure(
        error: SandboxError,
        isolation_id: IsolationId,
        usage: Option<ResourceUsageSnapshot>,
    ) -> Self {
        let reason = error.to_string();
        Self::Failure {
            error,
            isolation_id,
            reason,
            usage,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub const fn isolation_id(&self) -> &IsolationId {
        match self {
            Self::Success { isolation_id, .. } | Self::Failure { isolation_id, .. } => isolation_id,
        }
    }

    pub const fn usage(&self) -> Option<&ResourceUsageSnapshot> {
        match self {
            Self::Success { usage, .. } => Some(usage),
            Self::Failure { usage, .. } => usage.as_ref(),
        }
    }

    pub fn violation_kind(&self) -> Option<ViolationKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => error.violation_kind(),
        }
    }

    pub const fn error(&self) -> Option<&SandboxError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    /// Success value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success { value, .. } => Some(value),
            Self::Failure { .. } => None,
        }
    }

    /// Convert into a plain `Result`, dropping metadata.
    pub fn into_result(self) -> Result<T, SandboxError> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Failure { error, .. } => Err(error),
        }
    }

    /// Map the success value, keeping all metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionResult<U> {
        match self {
            Self::Success {
                value,
                isolation_id,
                usage,
                execution_time,
            } => ExecutionResult::Success {
                value: f(value),
                isolation_id,
                usage,
                execution_time,
            },
            Self::Failure {
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
}
