//! Fork & exec for an ordinary inittab entry (startup or shutdown list).
//! Grounded on the source's `spawn_exec`/`setup_child`/`safe_dup`.
//!
//! The child path never touches `tracing` or any other allocating
//! logging machinery once it starts tearing down stdio — diagnostics
//! past that point would race the very descriptors being replaced. It
//! does, however, use ordinary heap allocation (tokenizing the command
//! line) before that point: this process is single-threaded up to the
//! call to `fork`, so the allocator-deadlock hazard strict
//! async-signal-safety discipline guards against does not apply here.

use nix::fcntl::{open, OFlag};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::sys::stat::Mode;
use nix::unistd::{dup2, setsid, Pid};
use sentineld_inittab::entry::InittabEntry;
use sentineld_sys::console::{open_console, reset_console, set_controlling_tty};
use sentineld_sys::process::{fork_process, Forked};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

pub enum SpawnOutcome {
    Spawned(Pid),
    ForkFailed,
}

/// Forks `entry` and exec's it in the child. The child branch never
/// returns.
pub fn spawn_exec(entry: &InittabEntry, log_device: &Path) -> SpawnOutcome {
    // SAFETY: `run_child` performs only process-local setup and a final
    // `execvpe`/`_exit` before returning control to the kernel; nothing
    // async-signal-unsafe runs past the point it starts tearing down
    // stdio (see module doc for the allocation-before-that-point caveat).
    match unsafe { fork_process() } {
        Ok(Forked::Parent(pid)) => {
            tracing::info!(pid = pid.as_raw(), process = entry.process_name.as_str(), "spawned");
            SpawnOutcome::Spawned(pid)
        }
        Ok(Forked::Child) => run_child(entry, log_device),
        Err(e) => {
            tracing::error!(process = entry.process_name.as_str(), error = %e, "fork failed");
            SpawnOutcome::ForkFailed
        }
    }
}

fn run_child(entry: &InittabEntry, log_device: &Path) -> ! {
    if sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None).is_err() {
        std::process::exit(1);
    }

    let Ok(cmdline) = sentineld_cmdline::cmdline::parse(&entry.process_name) else {
        std::process::exit(1);
    };

    let _ = setsid();

    if let Some(core_id) = entry.core_id {
        let mut cpu_set = CpuSet::new();
        if cpu_set.set(core_id as usize).is_err() {
            std::process::exit(1);
        }
        if sched_setaffinity(Pid::from_raw(0), &cpu_set).is_err() {
            std::process::exit(1);
        }
    }

    let stdio_result = if entry.ctty_path.is_empty() {
        setup_stdio_default(log_device)
    } else {
        setup_stdio_ctty(Path::new(&entry.ctty_path))
    };
    if stdio_result.is_err() {
        std::process::exit(1);
    }

    let Ok(prepared) =
        sentineld_sys::execve::PreparedExecve::new(&cmdline.args[0], &cmdline.args, &cmdline.env)
    else {
        std::process::exit(1);
    };
    prepared.exec();
    std::process::exit(1);
}

/// Dups `source` onto every fd in `targets`, first moving it above fd 2
/// if it isn't already (the source's `safe_dup`), so replacing stdio
/// never clobbers the very descriptor being duplicated.
fn dup_onto(source: RawFd, targets: &[RawFd]) -> nix::Result<()> {
    let safe = if source > 2 {
        source
    } else {
        nix::fcntl::fcntl(source, nix::fcntl::FcntlArg::F_DUPFD(3))?
    };
    for &target in targets {
        dup2(safe, target)?;
    }
    if safe != source {
        let _ = nix::unistd::close(safe);
    }
    Ok(())
}

/// No `<ctty>`: stdin from `/dev/null`, stdout/stderr onto the log
/// device, matching the source's `setup_stdio`.
fn setup_stdio_default(log_device: &Path) -> nix::Result<()> {
    let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
    dup_onto(devnull, &[0])?;
    if devnull > 2 {
        let _ = nix::unistd::close(devnull);
    }

    let log_fd = open(
        log_device,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_NOCTTY,
        Mode::from_bits_truncate(0o600),
    )?;
    dup_onto(log_fd, &[1, 2])?;
    if log_fd > 2 {
        let _ = nix::unistd::close(log_fd);
    }
    Ok(())
}

/// `<ctty>` given: open it, grant it as stdin/stdout/stderr, reset its
/// termios to canonical mode, and make it the controlling terminal.
/// Every step here only matters as success-or-failure to its caller
/// (which exits nonzero either way), so `ConsoleError`'s detail collapses
/// to a single sentinel `nix::Error`.
fn setup_stdio_ctty(path: &Path) -> nix::Result<()> {
    let fd = open_console(path, OFlag::O_RDWR).map_err(|_| nix::Error::EIO)?;
    let raw = fd.as_raw_fd();
    dup_onto(raw, &[0, 1, 2])?;
    reset_console(0).map_err(|_| nix::Error::EIO)?;
    set_controlling_tty(0).map_err(|_| nix::Error::EIO)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_onto_a_low_fd_moves_it_above_stdio_first() {
        // fd 0 (stdin) is always open in the test harness; duplicating it
        // onto itself must not panic or deadlock.
        assert!(dup_onto(0, &[]).is_ok());
    }
}
