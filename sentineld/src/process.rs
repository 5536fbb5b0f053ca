//! The live-process table (C2): a pid-indexed map of running children,
//! each carrying the inittab entry it was spawned from. Insertion happens
//! on successful fork, removal on reap — nothing else touches membership.

use nix::unistd::Pid;
use sentineld_inittab::entry::InittabEntry;
use std::collections::HashMap;

/// A single live child: the configuration it was spawned from, kept
/// around so the reaper can decide whether its death matters.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: Pid,
    pub entry: InittabEntry,
}

/// The set of live children, the source's singly-linked `process` list
/// replaced by a `HashMap` keyed on pid — structural sharing was never
/// needed once a record is created, and lookup by pid is the only access
/// pattern the reaper exercises.
#[derive(Debug, Default)]
pub struct RunningSet {
    processes: HashMap<i32, Process>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, process: Process) {
        self.processes.insert(process.pid.as_raw(), process);
    }

    /// Removes and returns the record for `pid`. Callers that expect the
    /// pid to be a member (every reap path) log loudly when it isn't;
    /// an unrecognized pid is not itself fatal, since it can only mean a
    /// double-reap or a stray child the table never knew about.
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.processes.remove(&pid.as_raw())
    }

    pub fn find(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid.as_raw())
    }

    pub fn find_safe_mode(&self) -> Option<&Process> {
        self.processes
            .values()
            .find(|p| p.entry.entry_type == sentineld_inittab::entry::EntryType::SafeMode)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Process> + '_ {
        self.processes.drain().map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentineld_inittab::entry::EntryType;

    fn entry(entry_type: EntryType) -> InittabEntry {
        InittabEntry {
            order: Some(0),
            core_id: None,
            entry_type,
            ctty_path: String::new(),
            process_name: "/bin/true".into(),
        }
    }

    #[test]
    fn insert_then_find_then_remove() {
        let mut set = RunningSet::new();
        let pid = Pid::from_raw(123);
        set.insert(Process { pid, entry: entry(EntryType::Service) });
        assert!(set.find(pid).is_some());
        assert_eq!(set.len(), 1);
        let removed = set.remove(pid).unwrap();
        assert_eq!(removed.pid, pid);
        assert!(set.find(pid).is_none());
    }

    #[test]
    fn find_safe_mode_locates_the_one_placeholder() {
        let mut set = RunningSet::new();
        set.insert(Process { pid: Pid::from_raw(1), entry: entry(EntryType::Service) });
        set.insert(Process { pid: Pid::from_raw(2), entry: entry(EntryType::SafeMode) });
        let found = set.find_safe_mode().unwrap();
        assert_eq!(found.pid, Pid::from_raw(2));
    }

    #[test]
    fn removing_an_unknown_pid_returns_none() {
        let mut set = RunningSet::new();
        assert!(set.remove(Pid::from_raw(999)).is_none());
    }
}
