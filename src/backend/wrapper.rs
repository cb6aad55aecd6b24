//! Self-monitoring shell wrapper injected around process-backend scripts.
//!
//! The user script lives in its own file and runs as a child shell of the
//! wrapper, so nothing in it can alter the wrapper's control flow. Denied
//! commands are shadowed by executables on a private lookup path rather than
//! shell functions, which a script could simply unset.
//!
//! Exit-code contract seen by the parent:
//! - `0` success
//! - `1` monitor tripped (reason written to [`VIOLATION_FILE`])
//! - `2` script error (a script's own `exit 1` is folded into this)
//! - anything else passes through unchanged
//!
//! A shim or the wall-clock monitor kills the whole process group after
//! recording its reason, so the parent may also see a signal with a
//! populated [`VIOLATION_FILE`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::ViolationKind;

/// File inside the scratch directory where the monitor records why it fired.
pub(crate) const VIOLATION_FILE: &str = ".violation";

/// The user script, next to the wrapper.
pub(crate) const USER_SCRIPT_FILE: &str = "user.sh";

/// Directory of denied-command shims, searched first by the user script.
pub(crate) const SHIM_DIR: &str = "bin";

/// Commands that are shadowed with a tripping shim.
pub(crate) const DENIED_COMMANDS: &[&str] = &[
    "sudo", "su", "doas", "mount", "umount", "chroot", "nsenter", "unshare", "reboot", "shutdown",
    "halt", "poweroff", "insmod", "rmmod", "modprobe", "iptables", "setcap",
];

const SYSTEM_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// SIGXCPU seen as a shell status.
const XCPU_STATUS: i32 = 128 + 24;

/// SIGABRT and SIGSEGV seen as shell statuses; allocation failures under
/// `ulimit -v` surface as one of these.
const MEMORY_CRASH_STATUSES: [i32; 2] = [128 + 6, 128 + 11];

/// Inputs for one rendered wrapper.
#[derive(Debug)]
pub(crate) struct WrapperSpec<'a> {
    pub script: &'a str,
    /// Shell that runs the user script.
    pub shell: &'a Path,
    pub scratch_dir: &'a Path,
    pub memory_kb: u64,
    pub cpu_seconds: Option<u64>,
    /// In-child wall clock, set past the parent's own deadline.
    pub monitor_seconds: u64,
    pub bindings: &'a HashMap<String, Value>,
}

/// Everything the wrapper needs on disk.
#[derive(Debug)]
pub(crate) struct WrapperFiles {
    pub wrapper: String,
    pub user_script: String,
    /// `(command, shim text)`; written under [`SHIM_DIR`] as executables.
    pub shims: Vec<(&'static str, String)>,
}

/// Render the wrapper, the user script and the shims.
pub(crate) fn render(spec: &WrapperSpec<'_>) -> WrapperFiles {
    let marker = spec.scratch_dir.join(VIOLATION_FILE);
    let marker = shell_quote(&marker.to_string_lossy());
    WrapperFiles {
        wrapper: render_wrapper(spec, &marker),
        user_script: render_user_script(spec),
        shims: DENIED_COMMANDS
            .iter()
            .map(|cmd| (*cmd, render_shim(cmd, &marker)))
            .collect(),
    }
}

fn render_wrapper(spec: &WrapperSpec<'_>, marker: &str) -> String {
    let user = spec.scratch_dir.join(USER_SCRIPT_FILE);
    let mut out = String::with_capacity(2048);

    out.push_str("#!/bin/sh\n");
    out.push_str("exec 2>&1\n");
    let _ = writeln!(out, "PATH={SYSTEM_PATH}");
    let _ = writeln!(out, "__sbx_marker={marker}");
    let _ = writeln!(out, "ulimit -v {} 2>/dev/null || :", spec.memory_kb);
    if let Some(secs) = spec.cpu_seconds {
        let _ = writeln!(out, "ulimit -t {secs} 2>/dev/null || :");
    }

    let _ = writeln!(
        out,
        "{} {} &",
        shell_quote(&spec.shell.to_string_lossy()),
        shell_quote(&user.to_string_lossy())
    );
    out.push_str("__sbx_pid=$!\n");
    let _ = writeln!(
        out,
        "( sleep {}; printf 'timeout: wall-time monitor fired\\n' > \"$__sbx_marker\"; kill -9 0 ) >/dev/null 2>&1 &",
        spec.monitor_seconds
    );
    out.push_str("__sbx_watch=$!\n");
    out.push_str("wait \"$__sbx_pid\"\n");
    out.push_str("__sbx_rc=$?\n");
    out.push_str("kill \"$__sbx_watch\" 2>/dev/null\n");
    out.push_str("if [ -s \"$__sbx_marker\" ]; then exit 1; fi\n");
    out.push_str("case $__sbx_rc in\n");
    let _ = writeln!(
        out,
        "    {XCPU_STATUS}) printf 'resource: cpu-time limit exceeded\\n' > \"$__sbx_marker\"; exit 1 ;;"
    );
    let _ = writeln!(
        out,
        "    {}|{}) printf 'resource: memory limit of {}KB exceeded\\n' > \"$__sbx_marker\"; exit 1 ;;",
        MEMORY_CRASH_STATUSES[0], MEMORY_CRASH_STATUSES[1], spec.memory_kb
    );
    out.push_str("    1) exit 2 ;;\n");
    out.push_str("esac\n");
    out.push_str("exit $__sbx_rc\n");
    out
}

/// Lookup path and bindings, then the script untouched.
fn render_user_script(spec: &WrapperSpec<'_>) -> String {
    let shims = spec.scratch_dir.join(SHIM_DIR);
    let mut out = String::with_capacity(spec.script.len() + 256);
    // Lookup path only; never exported to the script's environment.
    let _ = writeln!(out, "PATH={}:{SYSTEM_PATH}", shell_quote(&shims.to_string_lossy()));

    let mut names: Vec<&String> = spec.bindings.keys().collect();
    names.sort();
    for name in names {
        if !is_shell_identifier(name) {
            debug!(binding = %name, "Skipping binding with non-shell name");
            continue;
        }
        let value = match &spec.bindings[name] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(out, "{name}={}", shell_quote(&value));
    }

    out.push_str(spec.script);
    if !spec.script.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn render_shim(cmd: &str, marker: &str) -> String {
    let reason = format!("malicious: denied command: {cmd}");
    let mut out = String::from("#!/bin/sh\n");
    let _ = writeln!(out, "printf '%s\\n' {} > {marker}", shell_quote(&reason));
    let _ = writeln!(out, "printf 'sandbox: denied command: %s\\n' {} >&2", shell_quote(cmd));
    out.push_str("kill -9 0\n");
    out
}

/// Map a recorded monitor reason onto a violation kind and message.
pub(crate) fn parse_violation(recorded: &str) -> (ViolationKind, String) {
    let recorded = recorded.trim();
    let (kind, reason) = match recorded.split_once(": ") {
        Some(("resource", reason)) => (ViolationKind::ResourceLimitExceeded, reason),
        Some(("timeout", reason)) => (ViolationKind::ExecutionTimeout, reason),
        Some(("malicious", reason)) => (ViolationKind::MaliciousCodeDetected, reason),
        _ => (ViolationKind::MaliciousCodeDetected, recorded),
    };
    (kind, reason.to_string())
}

/// Single-quote `s` for POSIX sh.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("__sbx")
        && name != "PATH"
}
