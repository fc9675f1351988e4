//! In-memory table of agent-tracked children (spec §3.2, §9 redesign
//! note 2: a `HashMap` keyed by host PID with entries removed outright
//! on reap, replacing the original fixed-capacity array with a dead
//! `active` flag).

use std::collections::HashMap;

use libc::pid_t;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub host_pid: pid_t,
    pub name: String,
    /// Whether `ApplyConstraints` has ever succeeded for this PID, so
    /// the reaper knows whether a cgroup-removal attempt is worthwhile.
    pub cgroup_applied: bool,
}

#[derive(Default)]
pub struct ProcessRegistry {
    entries: HashMap<pid_t, ProcessRecord>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host_pid: pid_t, name: String) {
        self.entries.insert(
            host_pid,
            ProcessRecord {
                host_pid,
                name,
                cgroup_applied: false,
            },
        );
    }

    pub fn get(&self, host_pid: pid_t) -> Option<&ProcessRecord> {
        self.entries.get(&host_pid)
    }

    pub fn mark_cgroup_applied(&mut self, host_pid: pid_t) {
        if let Some(record) = self.entries.get_mut(&host_pid) {
            record.cgroup_applied = true;
        }
    }

    /// Remove and return the record for `host_pid`, if present. Once
    /// removed a PID cannot reappear (spec P5): the only way back in
    /// is a fresh `StartProcess`, which the kernel guarantees won't
    /// reuse a still-tracked PID (§3.2 invariants).
    pub fn remove(&mut self, host_pid: pid_t) -> Option<ProcessRecord> {
        self.entries.remove(&host_pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_remove_is_not_found_afterwards() {
        let mut reg = ProcessRegistry::new();
        reg.insert(100, "/bin/sleep".to_string());
        assert!(reg.get(100).is_some());
        let removed = reg.remove(100).unwrap();
        assert_eq!(removed.host_pid, 100);
        assert!(reg.get(100).is_none());
        // removing again is a no-op, not a panic or a reappearance
        assert!(reg.remove(100).is_none());
    }

    #[test]
    fn cgroup_applied_flag_tracks_apply_constraints() {
        let mut reg = ProcessRegistry::new();
        reg.insert(1, "x".to_string());
        assert!(!reg.get(1).unwrap().cgroup_applied);
        reg.mark_cgroup_applied(1);
        assert!(reg.get(1).unwrap().cgroup_applied);
    }
}
