//! Best-effort usage sampling for child processes.
//!
//! Reads `/proc/<pid>/stat` and `/proc/<pid>/status` on Linux. Other
//! platforms report nothing, and the snapshot fields stay `None`.

/// Aggregated observations for one child process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ProcSample {
    /// utime + stime + cutime + cstime.
    pub cpu_time_ms: Option<u64>,
    /// Peak resident set (`VmHWM`) of the top-level process.
    pub peak_memory_bytes: Option<u64>,
    pub peak_threads: Option<u32>,
}

impl ProcSample {
    /// Fold a newer observation into this one, keeping peaks.
    pub fn merge(&mut self, newer: Self) {
        self.cpu_time_ms = max_opt(self.cpu_time_ms, newer.cpu_time_ms);
        self.peak_memory_bytes = max_opt(self.peak_memory_bytes, newer.peak_memory_bytes);
        self.peak_threads = max_opt(self.peak_threads, newer.peak_threads);
    }
}

fn max_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Sample a live process. `None` once the process is gone.
#[cfg(target_os = "linux")]
pub(crate) fn sample_pid(pid: u32) -> Option<ProcSample> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (cpu_time_ms, threads) = parse_stat(&stat, clock_ticks())?;
    let peak_memory_bytes = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|s| parse_status_kb(&s, "VmHWM:"))
        .map(|kb| kb * 1024);
    Some(ProcSample {
        cpu_time_ms: Some(cpu_time_ms),
        peak_memory_bytes,
        peak_threads: Some(threads),
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sample_pid(_pid: u32) -> Option<ProcSample> {
    None
}

#[cfg(target_os = "linux")]
fn clock_ticks() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};

    sysconf(SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .and_then(|t| u64::try_from(t).ok())
        .filter(|t| *t > 0)
        .unwrap_or(100)
}

/// Parse CPU milliseconds and thread count out of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub(crate) fn parse_stat(stat: &str, ticks_per_sec: u64) -> Option<(u64, u32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3 of the full line).
    let tick = |i: usize| fields.get(i).and_then(|f| f.parse::<u64>().ok());
    let ticks = tick(11)? + tick(12)? + tick(13).unwrap_or(0) + tick(14).unwrap_or(0);
    let threads = fields.get(17)?.parse().ok()?;
    Some((ticks * 1000 / ticks_per_sec.max(1), threads))
}

/// Read a `kB` line such as `VmHWM:     1234 kB` from `/proc/<pid>/status`.
pub(crate) fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}
