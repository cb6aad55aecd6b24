//! Sandbox configuration.
//!
//! The surrounding pipeline engine owns configuration loading; this crate
//! only needs the resulting ceilings. They arrive as JSON, either inline in
//! `PIPELINE_SANDBOX_CONFIG` or in a file named by
//! `PIPELINE_SANDBOX_CONFIG_FILE`. Every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Environment variable carrying inline JSON configuration.
pub const CONFIG_ENV: &str = "PIPELINE_SANDBOX_CONFIG";

/// Environment variable naming a JSON configuration file.
pub const CONFIG_FILE_ENV: &str = "PIPELINE_SANDBOX_CONFIG_FILE";

/// Top-level configuration for the sandbox.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxConfig {
    /// Hard ceilings enforced before dispatch.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Settings for the OS-process backend.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Settings for the embedded interpreter backend.
    #[serde(default)]
    pub interpreter: InterpreterConfig,
}

/// Global ceilings checked by the policy validator.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: i64,

    #[serde(default = "default_max_cpu_time_ms")]
    pub max_cpu_time_ms: i64,

    #[serde(default = "default_max_wall_time_ms")]
    pub max_wall_time_ms: i64,

    #[serde(default = "default_max_threads")]
    pub max_threads: i64,

    #[serde(default = "default_max_file_handles")]
    pub max_file_handles: i64,

    /// Largest environment accepted at the constrained level.
    #[serde(default = "default_max_env_vars_constrained")]
    pub max_env_vars_constrained: usize,

    /// Variable names considered system-scoped.
    #[serde(default = "default_system_env_vars")]
    pub system_env_vars: Vec<String>,

    /// Name prefixes considered system-scoped.
    #[serde(default = "default_system_env_prefixes")]
    pub system_env_prefixes: Vec<String>,

    /// Deadline applied when a request declares none.
    #[serde(default = "default_wall_time_ms")]
    pub default_wall_time_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_time_ms: default_max_cpu_time_ms(),
            max_wall_time_ms: default_max_wall_time_ms(),
            max_threads: default_max_threads(),
            max_file_handles: default_max_file_handles(),
            max_env_vars_constrained: default_max_env_vars_constrained(),
            system_env_vars: default_system_env_vars(),
            system_env_prefixes: default_system_env_prefixes(),
            default_wall_time_ms: default_wall_time_ms(),
        }
    }
}

impl PolicyConfig {
    pub const fn default_wall_time(&self) -> Duration {
        Duration::from_millis(self.default_wall_time_ms)
    }

    /// Whether `name` refers to a system-scoped variable.
    pub fn is_system_env(&self, name: &str) -> bool {
        self.system_env_vars.iter().any(|v| v == name)
            || self.system_env_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// OS-process backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Interpreter binary the script file is handed to.
    #[serde(default = "default_runtime")]
    pub runtime: PathBuf,

    /// Arguments placed before the memory flag and script path.
    #[serde(default)]
    pub runtime_args: Vec<String>,

    /// Memory flag template for runtimes that take one, e.g. `-Xmx{mb}m`.
    #[serde(default)]
    pub memory_flag: Option<String>,

    #[serde(default = "default_process_memory_mb")]
    pub default_memory_mb: u64,

    #[serde(default = "default_memory_floor_mb")]
    pub min_memory_mb: u64,

    #[serde(default = "default_memory_ceiling_mb")]
    pub max_memory_mb: u64,

    /// Only variables starting with one of these prefixes are forwarded.
    #[serde(default = "default_env_allow_prefixes")]
    pub env_allow_prefixes: Vec<String>,

    /// Never forwarded, even when a prefix matches.
    #[serde(default = "default_env_deny")]
    pub env_deny: Vec<String>,

    /// Time between the graceful signal and the forced kill.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_wall_time_ms")]
    pub default_wall_time_ms: u64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Parent of the per-execution scratch directories.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,

    /// How often a running child's usage is sampled.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            runtime_args: Vec::new(),
            memory_flag: None,
            default_memory_mb: default_process_memory_mb(),
            min_memory_mb: default_memory_floor_mb(),
            max_memory_mb: default_memory_ceiling_mb(),
            env_allow_prefixes: default_env_allow_prefixes(),
            env_deny: default_env_deny(),
            grace_period_ms: default_grace_period_ms(),
            default_wall_time_ms: default_wall_time_ms(),
            max_output_bytes: default_max_output_bytes(),
            temp_root: None,
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl ProcessConfig {
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub const fn default_wall_time(&self) -> Duration {
        Duration::from_millis(self.default_wall_time_ms)
    }

    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Memory ceiling for a child: the request's value (or the default)
    /// clamped into `[min_memory_mb, max_memory_mb]`.
    pub fn effective_memory_mb(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_memory_mb)
            .clamp(self.min_memory_mb, self.max_memory_mb.max(self.min_memory_mb))
    }

    /// Whether the runtime is a POSIX shell, which gets the monitor wrapper.
    pub fn runtime_is_shell(&self) -> bool {
        self.runtime
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| matches!(n, "sh" | "bash" | "dash" | "ash" | "ksh" | "zsh"))
    }
}

/// Embedded interpreter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterConfig {
    #[serde(default = "default_heap_mb")]
    pub default_heap_mb: u64,

    #[serde(default = "default_max_heap_mb")]
    pub max_heap_mb: u64,

    /// CPU budget when the request sets none.
    #[serde(default = "default_cpu_budget_ms")]
    pub default_cpu_budget_ms: u64,

    #[serde(default = "default_wall_time_ms")]
    pub default_wall_time_ms: u64,

    /// `host` members reachable at the constrained tier.
    #[serde(default = "default_allowed_host_members")]
    pub allowed_host_members: Vec<String>,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            default_heap_mb: default_heap_mb(),
            max_heap_mb: default_max_heap_mb(),
            default_cpu_budget_ms: default_cpu_budget_ms(),
            default_wall_time_ms: default_wall_time_ms(),
            allowed_host_members: default_allowed_host_members(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl InterpreterConfig {
    pub fn heap_limit_bytes(&self, requested_mb: Option<u64>) -> usize {
        let mb = requested_mb
            .unwrap_or(self.default_heap_mb)
            .min(self.max_heap_mb)
            .max(1);
        usize::try_from(mb * 1024 * 1024).unwrap_or(usize::MAX)
    }

    pub const fn default_cpu_budget(&self) -> Duration {
        Duration::from_millis(self.default_cpu_budget_ms)
    }

    pub const fn default_wall_time(&self) -> Duration {
        Duration::from_millis(self.default_wall_time_ms)
    }
}

impl SandboxConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Priority: `PIPELINE_SANDBOX_CONFIG` > `PIPELINE_SANDBOX_CONFIG_FILE` > defaults.
    pub fn from_env() -> Result<Self> {
        if let Ok(json) = std::env::var(CONFIG_ENV) {
            return Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"));
        }
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            return Self::from_file(Path::new(&path));
        }
        debug!("No sandbox configuration supplied, using defaults");
        Ok(Self::default())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse sandbox configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sandbox configuration: {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid sandbox configuration: {}", path.display()))
    }
}

const fn default_max_memory_mb() -> i64 {
    4096
}

const fn default_max_cpu_time_ms() -> i64 {
    300_000
}

const fn default_max_wall_time_ms() -> i64 {
    3_600_000
}

const fn default_max_threads() -> i64 {
    64
}

const fn default_max_file_handles() -> i64 {
    1024
}

const fn default_max_env_vars_constrained() -> usize {
    50
}

fn default_system_env_vars() -> Vec<String> {
    [
        "PATH",
        "HOME",
        "SHELL",
        "USER",
        "LOGNAME",
        "HOSTNAME",
        "TMPDIR",
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "JAVA_HOME",
        "JAVA_TOOL_OPTIONS",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_system_env_prefixes() -> Vec<String> {
    vec!["SYSTEM_".to_string(), "LD_".to_string()]
}

const fn default_wall_time_ms() -> u64 {
    60_000
}

fn default_runtime() -> PathBuf {
    PathBuf::from("/bin/sh")
}

const fn default_process_memory_mb() -> u64 {
    512
}

const fn default_memory_floor_mb() -> u64 {
    64
}

const fn default_memory_ceiling_mb() -> u64 {
    2048
}

fn default_env_allow_prefixes() -> Vec<String> {
    ["PIPELINE_", "USER_", "CI_", "JOB_"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_env_deny() -> Vec<String> {
    [
        "PATH",
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "PIPELINE_TOKEN",
        "PIPELINE_SECRET",
        "CI_JOB_TOKEN",
        "CI_REGISTRY_PASSWORD",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

const fn default_grace_period_ms() -> u64 {
    5_000
}

const fn default_max_output_bytes() -> usize {
    1024 * 1024
}

const fn default_sample_interval_ms() -> u64 {
    50
}

const fn default_heap_mb() -> u64 {
    64
}

const fn default_max_heap_mb() -> u64 {
    512
}

const fn default_cpu_budget_ms() -> u64 {
    30_000
}

fn default_allowed_host_members() -> Vec<String> {
    vec!["print".to_string(), "workingDirectory".to_string()]
}
