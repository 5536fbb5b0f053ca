//! Forking and non-blocking reaping, kept as thin wrappers around `nix` so
//! the supervisor's scheduler can stay free of raw syscalls.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForkError {
    #[error("fork failed: {0}")]
    Failed(#[from] nix::Error),
}

/// `waitpid` returned an errno the supervisor has no recovery strategy for.
/// Every caller is expected to treat this as a reason to abort the process,
/// matching the source's blunt `panic("waitpid")`.
#[derive(Debug, Error)]
#[error("waitpid failed unexpectedly: {0}")]
pub struct ReapError(#[from] pub nix::Error);

pub enum Forked {
    Parent(Pid),
    Child,
}

/// # Safety
/// Only async-signal-safe operations may run in the child branch the
/// caller executes after this returns `Forked::Child`, up until `exec` or
/// `_exit`.
pub unsafe fn fork_process() -> Result<Forked, ForkError> {
    match fork()? {
        ForkResult::Parent { child } => Ok(Forked::Parent(child)),
        ForkResult::Child => Ok(Forked::Child),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exited {
    pub pid: Pid,
    pub abnormal: bool,
    /// Signal that killed the process, if any; `None` on a plain nonzero
    /// exit, matching the source's "send 0 for no signal" convention.
    pub signal: Option<i32>,
}

/// Drains every child that has exited without blocking, for use from a
/// `SIGCHLD` notification where the signal itself may have coalesced
/// several deaths into one wakeup.
///
/// `Err` is only returned for an errno the caller cannot recover from (not
/// `ECHILD`, which just means "nothing left to reap"); the supervisor is
/// expected to panic on it rather than keep scheduling against a `waitpid`
/// that no longer behaves sanely.
pub fn reap_all_nonblocking() -> Result<Vec<Exited>, ReapError> {
    let mut exited = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Ok(WaitStatus::Continued(_)) => break,
            Ok(WaitStatus::Exited(pid, code)) => exited.push(Exited {
                pid,
                abnormal: code != 0,
                signal: None,
            }),
            Ok(WaitStatus::Signaled(pid, sig, _core_dumped)) => exited.push(Exited {
                pid,
                abnormal: true,
                signal: Some(sig as i32),
            }),
            Ok(_) => continue,
            Err(nix::Error::ECHILD) => break,
            Err(e) => return Err(ReapError(e)),
        }
    }
    Ok(exited)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_returns_empty_when_no_children_exist() {
        let exited = reap_all_nonblocking().unwrap();
        assert!(exited.is_empty());
    }
}
