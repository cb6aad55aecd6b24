//! pipeline-sandbox CLI
//!
//! Runs one script through the sandbox manager and prints the outcome as
//! JSON. Configuration comes from `PIPELINE_SANDBOX_CONFIG` or
//! `PIPELINE_SANDBOX_CONFIG_FILE`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipeline_sandbox::{
    ExecutionContext, ExecutionResult, IsolationLevel, IsolationRequest, ResourceLimits, SandboxConfig,
    SandboxManager, ScriptDialect,
};

#[derive(Parser, Debug)]
#[command(name = "pipeline-sandbox")]
#[command(about = "Run an untrusted pipeline script under isolation and resource limits")]
struct Args {
    /// Script file to execute
    #[arg(long)]
    script: PathBuf,

    /// Script name used in ids and logs (defaults to the file name)
    #[arg(long)]
    name: Option<String>,

    /// Isolation level (trusted, constrained, isolated, process)
    #[arg(long)]
    level: Option<IsolationLevel>,

    /// Wall-clock timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Memory ceiling in MB
    #[arg(long)]
    memory_mb: Option<i64>,

    /// Environment variable passed to the script (repeatable)
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Treat the script as pipeline DSL and translate it first
    #[arg(long)]
    pipeline_dsl: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the result
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = SandboxConfig::from_env().context("Failed to load configuration")?;
    let script = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;
    let name = args.name.clone().unwrap_or_else(|| {
        args.script
            .file_name()
            .map_or_else(|| "script".to_string(), |n| n.to_string_lossy().into_owned())
    });

    let mut context = ExecutionContext::default();
    context.isolation_level = args.level;
    context.timeout = args.timeout_ms.map(Duration::from_millis);
    if let Some(mb) = args.memory_mb {
        context.resource_limits = Some(ResourceLimits::default().with_memory_mb(mb));
    }
    context.environment.extend(args.env);

    let dialect = if args.pipeline_dsl {
        ScriptDialect::Pipeline
    } else {
        ScriptDialect::Native
    };
    let request = IsolationRequest::new(script, name)
        .with_context(context)
        .with_dialect(dialect);

    info!(script = %request.script_name, level = ?args.level, "Executing script");

    let manager = SandboxManager::new(config);
    let result: ExecutionResult<Value> = manager.execute_securely(&request).await;
    manager.shutdown().await;

    let (report, code) = match &result {
        ExecutionResult::Success {
            value,
            isolation_id,
            usage,
            execution_time,
        } => (
            json!({
                "status": "success",
                "isolation_id": isolation_id,
                "value": value,
                "usage": usage,
                "execution_time_ms": u64::try_from(execution_time.as_millis()).unwrap_or(u64::MAX),
            }),
            ExitCode::SUCCESS,
        ),
        ExecutionResult::Failure {
            isolation_id,
            reason,
            usage,
            ..
        } => (
            json!({
                "status": "failure",
                "isolation_id": isolation_id,
                "violation": result.violation_kind(),
                "reason": reason,
                "usage": usage,
            }),
            ExitCode::FAILURE,
        ),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(code)
}
