//! Shutdown signal handling, TERM/KILL fan-out, and the final close.
//! Grounded on the source's `handle_shutdown_cmd`/`term_running_process`/
//! `kill_timeout_cb`/`do_reboot` in `main.c`.

use crate::eventloop::TimerResult;
use crate::supervisor::{self, SharedSupervisor, ShutdownCommand, Stage};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

pub fn command_for_signal(signo: i32) -> Option<ShutdownCommand> {
    if signo == libc::SIGTERM {
        Some(ShutdownCommand::Reboot)
    } else if signo == libc::SIGUSR1 {
        Some(ShutdownCommand::Halt)
    } else if signo == libc::SIGUSR2 {
        Some(ShutdownCommand::PowerOff)
    } else {
        None
    }
}

/// Entered once per boot: a second shutdown signal while one is already
/// underway is a no-op, matching the source's single-shot `shutdown_cmd`
/// latch.
pub fn handle_shutdown_signal(sup: &SharedSupervisor, signo: i32) {
    let Some(command) = command_for_signal(signo) else {
        return;
    };
    let already_shutting_down = matches!(
        sup.borrow().stage,
        Stage::Termination | Stage::Shutdown | Stage::Close
    );
    if already_shutting_down {
        return;
    }

    tracing::info!(?command, "shutdown signal received, entering termination stage");
    supervisor::cancel_one_shot_timer(sup);
    {
        let mut guard = sup.borrow_mut();
        guard.shutdown_command = command;
        guard.remaining = None;
        guard.stage = Stage::Termination;
    }
    term_running_process(sup);
    arm_kill_timer(sup);
    reattach_stage_maintenance(sup);
}

/// Sends `SIGTERM` to every running process except the safe-mode
/// placeholder, which must survive through to the very last moment in
/// case one of the others dies abnormally while it is trying to exit.
fn term_running_process(sup: &SharedSupervisor) {
    let safe_mode_pid = sup.borrow().safe_mode.placeholder_pid();
    let targets: Vec<Pid> = sup
        .borrow()
        .running
        .iter()
        .map(|p| p.pid)
        .filter(|&pid| pid != safe_mode_pid)
        .collect();
    for pid in targets {
        tracing::info!(pid = pid.as_raw(), "sending SIGTERM for shutdown");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::warn!(pid = pid.as_raw(), error = %e, "could not SIGTERM process during shutdown");
        }
    }
}

fn arm_kill_timer(sup: &SharedSupervisor) {
    let supervisor = sup.clone();
    let (event_loop, timeout) = {
        let guard = sup.borrow();
        (guard.event_loop.clone(), guard.config.term_timeout)
    };
    let callback = Box::new(move || {
        kill_all_remaining(&supervisor);
        TimerResult::Stop
    });
    match event_loop.borrow_mut().add_timer(timeout, callback) {
        Ok(handle) => sup.borrow_mut().kill_timer = Some(handle),
        Err(e) => tracing::error!(error = %e, "could not arm termination grace-period timer"),
    }
}

/// Fired when the termination grace period expires with processes still
/// alive: escalate straight to `SIGKILL`, again sparing the placeholder.
fn kill_all_remaining(sup: &SharedSupervisor) {
    let safe_mode_pid = sup.borrow().safe_mode.placeholder_pid();
    let targets: Vec<Pid> = sup
        .borrow()
        .running
        .iter()
        .map(|p| p.pid)
        .filter(|&pid| pid != safe_mode_pid)
        .collect();
    for pid in targets {
        tracing::warn!(pid = pid.as_raw(), "termination grace period expired, sending SIGKILL");
        let _ = kill(pid, Signal::SIGKILL);
    }
    sup.borrow_mut().kill_timer = None;
}

fn reattach_stage_maintenance(sup: &SharedSupervisor) {
    let supervisor = sup.clone();
    let event_loop = sup.borrow().event_loop.clone();
    event_loop
        .borrow_mut()
        .set_post_iteration_callback(Some(Box::new(move || {
            crate::scheduler::stage_maintenance(&supervisor);
        })));
}

/// Runs once [`crate::eventloop::start`] returns with `Stage::Close`:
/// flush the page cache, tear down mounts, disarm the watchdog, and ask
/// the kernel to reboot/halt/power off. Never returns.
pub fn finalize(sup: &SharedSupervisor) -> ! {
    nix::unistd::sync();
    sentineld_sys::mount::mount_umount_filesystems();

    let watchdog = sup.borrow_mut().watchdog.take();
    if let Some(handle) = watchdog {
        handle.close(true);
    }

    let command = sup.borrow().shutdown_command;
    do_reboot(command)
}

fn do_reboot(command: ShutdownCommand) -> ! {
    let mode = match command {
        ShutdownCommand::Reboot => nix::sys::reboot::RebootMode::RB_AUTOBOOT,
        ShutdownCommand::Halt => nix::sys::reboot::RebootMode::RB_HALT_SYSTEM,
        ShutdownCommand::PowerOff => nix::sys::reboot::RebootMode::RB_POWER_OFF,
    };
    if let Err(e) = nix::sys::reboot::reboot(mode) {
        tracing::error!(error = %e, "reboot() failed");
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_to_command_mapping_matches_the_three_handled_signals() {
        assert_eq!(command_for_signal(libc::SIGTERM), Some(ShutdownCommand::Reboot));
        assert_eq!(command_for_signal(libc::SIGUSR1), Some(ShutdownCommand::Halt));
        assert_eq!(command_for_signal(libc::SIGUSR2), Some(ShutdownCommand::PowerOff));
        assert_eq!(command_for_signal(libc::SIGHUP), None);
    }
}
