//! Best-effort process identity verification for crash recovery (§4.4
//! "Identity"): on restart, a `running` Agent record is only trusted if
//! its pid is alive and its process start time still matches to the
//! second.
//!
//! Liveness is a `libc::kill(pid, 0)` probe; start time comes from
//! `/proc/{pid}/stat` since a bare liveness check can't tell a live
//! original process apart from a dead one whose pid got reused.

use chrono::{DateTime, TimeZone, Utc};

/// `true` if a process with this pid currently exists (signal 0 never
/// actually delivered, just checks permission + existence).
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Start time of a running process, truncated to the second, or `None`
/// if it can't be determined (process gone, non-Linux, malformed
/// `/proc` entry).
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: u32) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the `comm` field (which itself may contain spaces and
    // is wrapped in parens) are space-separated; starttime is field 22
    // counting from 1, i.e. index 19 after comm.
    let comm_end = stat.rfind(')')?;
    let rest = &stat[comm_end + 2..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // state=0, ppid=1, ... starttime is index 19 in this zero-based
    // slice (field 22 overall minus the 3 we've already consumed: pid,
    // comm, state).
    let starttime_ticks: u64 = fields.get(19)?.parse().ok()?;

    let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if clk_tck <= 0 {
        return None;
    }

    let uptime_str = std::fs::read_to_string("/proc/uptime").ok()?;
    let uptime_secs: f64 = uptime_str.split_whitespace().next()?.parse().ok()?;
    let boot_time = Utc::now() - chrono::Duration::milliseconds((uptime_secs * 1000.0) as i64);

    let start_offset_secs = starttime_ticks as f64 / clk_tck as f64;
    let started_at = boot_time + chrono::Duration::milliseconds((start_offset_secs * 1000.0) as i64);
    Some(Utc.timestamp_opt(started_at.timestamp(), 0).single()?)
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: u32) -> Option<DateTime<Utc>> {
    None
}

/// `true` if `pid` is alive and (where determinable) its start time
/// matches `recorded_start` to the second.
pub fn identity_matches(pid: u32, recorded_start: DateTime<Utc>) -> bool {
    if !is_alive(pid) {
        return false;
    }
    match process_start_time(pid) {
        Some(actual) => actual.timestamp() == recorded_start.timestamp(),
        // Can't independently verify start time on this platform; fall
        // back to the liveness check alone.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        let pid = std::process::id();
        assert!(is_alive(pid));
    }

    #[test]
    fn bogus_pid_is_not_alive() {
        // PID 1 is init and always alive; pick a pid astronomically
        // unlikely to exist instead of hardcoding a "dead" pid.
        assert!(!is_alive(u32::MAX - 1));
    }
}
