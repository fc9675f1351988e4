//! Translate a host PID to the deepest-nested PID-namespace PID by
//! parsing `/proc/<pid>/status` (spec §4.4, §2.6).

use libc::pid_t;
use tracing::debug;

/// Returns the innermost-namespace PID for `host_pid`, or `host_pid`
/// unchanged if `/proc/<pid>/status` is gone, unreadable, or doesn't
/// carry an `NSpid:` line — all routine races with an exiting process,
/// not failures worth surfacing to the caller.
pub fn resolve_container_pid(host_pid: pid_t) -> pid_t {
    let path = format!("/proc/{host_pid}/status");
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            debug!(pid = host_pid, error = %e, "could not read {path} to resolve namespace pid");
            return host_pid;
        }
    };

    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("NSpid:") {
            match rest.split_whitespace().last().and_then(|t| t.parse().ok()) {
                Some(ns_pid) => return ns_pid,
                None => {
                    debug!(pid = host_pid, "unparsable NSpid line: {line:?}");
                    return host_pid;
                }
            }
        }
    }

    host_pid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_resolves_to_some_positive_pid() {
        let host = std::process::id() as pid_t;
        let resolved = resolve_container_pid(host);
        assert!(resolved > 0);
    }

    #[test]
    fn nonexistent_pid_returns_input_unchanged() {
        // PID 2^30ish is exceedingly unlikely to exist
        let bogus = 999_999_999;
        assert_eq!(resolve_container_pid(bogus), bogus);
    }
}
