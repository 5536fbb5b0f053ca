//! The safe-mode placeholder (C3): a child forked very early, before any
//! other process, that blocks on a pipe read until the supervisor hands
//! it a crash descriptor — converting an unreliable "fork at crash time"
//! into a reliable "wake a pre-forked child". Grounded on the source's
//! `setup_safe_mode`/`start_safe_mode`/`find_safe_mode_process` (parent
//! side, in `main.c`) and `safe_mode_wait`/`execute_safe_mode` (child
//! side, in `safe-mode.c`).

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{pipe2, Pid};
use sentineld_sys::process::{fork_process, Forked};
use std::os::fd::{AsRawFd, OwnedFd};
use thiserror::Error;

/// `process_name` bounded and NUL-padded to this many bytes, followed by
/// a native-endian `i32` signal: the wire format written atomically
/// across the pipe. See spec §6.3.
pub const DESCRIPTOR_NAME_LEN: usize = 1024;
const DESCRIPTOR_LEN: usize = DESCRIPTOR_NAME_LEN + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeModeDescriptor {
    pub process_name: String,
    /// The signal that killed the dead entry, or `0` for a plain nonzero
    /// exit (no signal involved) — the source's own "send 0" convention.
    pub signal: i32,
}

impl SafeModeDescriptor {
    fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        let name = self.process_name.as_bytes();
        let n = name.len().min(DESCRIPTOR_NAME_LEN - 1);
        buf[..n].copy_from_slice(&name[..n]);
        buf[DESCRIPTOR_NAME_LEN..].copy_from_slice(&self.signal.to_ne_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; DESCRIPTOR_LEN]) -> Self {
        let name_len = buf[..DESCRIPTOR_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DESCRIPTOR_NAME_LEN);
        let process_name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        // `buf` is `[u8; DESCRIPTOR_LEN]`, so the tail slice is always 4 bytes.
        #[allow(clippy::expect_used)]
        let signal_bytes: [u8; 4] = buf[DESCRIPTOR_NAME_LEN..]
            .try_into()
            .expect("fixed-size slice");
        Self { process_name, signal: i32::from_ne_bytes(signal_bytes) }
    }
}

#[derive(Debug, Error)]
pub enum SafeModeError {
    #[error("could not create safe-mode pipe: {0}")]
    Pipe(#[source] Errno),
    #[error("could not fork safe-mode placeholder: {0}")]
    Fork(#[source] sentineld_sys::process::ForkError),
    #[error("write to safe-mode pipe failed: {0}")]
    Write(#[source] Errno),
    #[error("wrote zero bytes to safe-mode pipe")]
    ZeroWrite,
    #[error("safe-mode placeholder is unavailable even after a restart")]
    PlaceholderUnavailable,
}

struct Placeholder {
    pid: Pid,
    write_fd: OwnedFd,
}

enum WriteOutcome {
    Sent,
    BrokenPipe,
}

fn spawn_placeholder(recovery_cmdline: &str) -> Result<Placeholder, SafeModeError> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(SafeModeError::Pipe)?;

    // SAFETY: the child branch below performs no allocator-unsafe work
    // before it settles into a blocking read; unlike `spawn_exec`'s
    // child, this process has no concurrent sibling relying on
    // fork-time invariants, so ordinary heap use after this point is
    // fine (see DESIGN.md).
    match unsafe { fork_process() }.map_err(SafeModeError::Fork)? {
        Forked::Parent(pid) => {
            drop(read_fd);
            Ok(Placeholder { pid, write_fd })
        }
        Forked::Child => {
            drop(write_fd);
            run_placeholder_child(read_fd, recovery_cmdline)
        }
    }
}

fn block_all_signals() {
    if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), None) {
        tracing::warn!(error = %e, "could not block all signals in safe-mode placeholder");
    }
}

/// Never returns: reads exactly one descriptor off `read_fd`, then execs
/// the recovery program with `<proc>`/`<exitcode>` substituted into its
/// argument list. Any failure along the way exits nonzero, matching
/// `safe_mode_wait`'s own restraint.
fn run_placeholder_child(read_fd: OwnedFd, recovery_cmdline: &str) -> ! {
    block_all_signals();

    let mut buf = [0u8; DESCRIPTOR_LEN];
    let mut filled = 0usize;
    loop {
        match nix::unistd::read(read_fd.as_raw_fd(), &mut buf[filled..]) {
            Ok(0) => std::process::exit(1),
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    break;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(_) => std::process::exit(1),
        }
    }

    let descriptor = SafeModeDescriptor::from_bytes(&buf);
    exec_recovery(recovery_cmdline, &descriptor)
}

fn exec_recovery(recovery_cmdline: &str, descriptor: &SafeModeDescriptor) -> ! {
    let Ok(parsed) = sentineld_cmdline::cmdline::parse(recovery_cmdline) else {
        std::process::exit(1);
    };
    let exitcode = descriptor.signal.to_string();
    let args: Vec<String> = parsed
        .args
        .iter()
        .map(|tok| substitute_placeholders(tok, &descriptor.process_name, &exitcode))
        .collect();
    let Some(binary) = args.first() else {
        std::process::exit(1);
    };
    let Ok(prepared) = sentineld_sys::execve::PreparedExecve::new(binary, &args, &parsed.env) else {
        std::process::exit(1);
    };
    prepared.exec();
    std::process::exit(1);
}

fn substitute_placeholders(token: &str, proc_name: &str, exitcode: &str) -> String {
    token.replace("<proc>", proc_name).replace("<exitcode>", exitcode)
}

fn send_descriptor(
    placeholder: &Placeholder,
    descriptor: &SafeModeDescriptor,
) -> Result<WriteOutcome, SafeModeError> {
    let bytes = descriptor.to_bytes();
    let mut written = 0usize;
    while written < bytes.len() {
        match nix::unistd::write(&placeholder.write_fd, &bytes[written..]) {
            Ok(0) => return Err(SafeModeError::ZeroWrite),
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) => return Ok(WriteOutcome::BrokenPipe),
            Err(e) => return Err(SafeModeError::Write(e)),
        }
    }
    Ok(WriteOutcome::Sent)
}

/// Owns the placeholder's lifecycle: the single live instance, whether
/// the trigger has already fired, and the recovery command line needed
/// to re-fork a fresh placeholder after a pre-trigger death.
pub struct SafeModeState {
    placeholder: Placeholder,
    recovery_cmdline: String,
    pub safe_mode_on: bool,
}

impl SafeModeState {
    pub fn start(recovery_cmdline: String) -> Result<Self, SafeModeError> {
        let placeholder = spawn_placeholder(&recovery_cmdline)?;
        Ok(Self { placeholder, recovery_cmdline, safe_mode_on: false })
    }

    pub fn placeholder_pid(&self) -> Pid {
        self.placeholder.pid
    }

    /// Replaces a dead placeholder with a fresh one. Only valid before
    /// the trigger fires — a placeholder dying after the recovery
    /// program has taken over means the recovery program itself crashed,
    /// which is a supervision-impairing (panic) condition the caller
    /// must check for itself.
    pub fn restart_placeholder(&mut self) -> Result<(), SafeModeError> {
        debug_assert!(!self.safe_mode_on);
        self.placeholder = spawn_placeholder(&self.recovery_cmdline)?;
        Ok(())
    }

    /// Delivers `descriptor`. A broken pipe means the placeholder died
    /// before delivery — not retried blindly: escalate to a restart and
    /// retry the trigger exactly once against the fresh placeholder
    /// before giving up (open question 6).
    pub fn trigger(&mut self, descriptor: &SafeModeDescriptor) -> Result<(), SafeModeError> {
        if let WriteOutcome::Sent = send_descriptor(&self.placeholder, descriptor)? {
            self.safe_mode_on = true;
            return Ok(());
        }

        self.restart_placeholder()?;
        match send_descriptor(&self.placeholder, descriptor)? {
            WriteOutcome::Sent => {
                self.safe_mode_on = true;
                Ok(())
            }
            WriteOutcome::BrokenPipe => Err(SafeModeError::PlaceholderUnavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_its_wire_format() {
        let original = SafeModeDescriptor { process_name: "/bin/bad".into(), signal: 9 };
        let bytes = original.to_bytes();
        let decoded = SafeModeDescriptor::from_bytes(&bytes);
        assert_eq!(decoded, original);
    }

    #[test]
    fn an_overlong_process_name_is_truncated_not_rejected() {
        let long_name = "a".repeat(DESCRIPTOR_NAME_LEN * 2);
        let original = SafeModeDescriptor { process_name: long_name, signal: 0 };
        let bytes = original.to_bytes();
        let decoded = SafeModeDescriptor::from_bytes(&bytes);
        assert_eq!(decoded.process_name.len(), DESCRIPTOR_NAME_LEN - 1);
        assert_eq!(decoded.signal, 0);
    }

    #[test]
    fn placeholder_substitution_replaces_both_tokens() {
        let out = substitute_placeholders("dumped <proc> on signal <exitcode>", "/bin/bad", "9");
        assert_eq!(out, "dumped /bin/bad on signal 9");
    }
}
