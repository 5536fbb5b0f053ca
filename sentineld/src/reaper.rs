//! SIGCHLD handling: drain every exited child in one pass, decide which
//! deaths are safe-mode-worthy, and keep the wave cursor's one-shot
//! countdown honest. Grounded on the source's `handle_child_exit`.

use crate::fatal::panic_fatal;
use crate::safemode::SafeModeDescriptor;
use crate::supervisor::{self, SharedSupervisor, Stage};
use sentineld_inittab::entry::EntryType;
use sentineld_sys::process::Exited;

/// Drains every exited child off the table in one pass (mirrors the
/// source's `while (waitpid(...) > 0)` loop, now expressed as a `Vec`
/// rather than a blocking retry).
pub fn handle_sigchld(sup: &SharedSupervisor) {
    let exited: Vec<Exited> = match sentineld_sys::process::reap_all_nonblocking() {
        Ok(v) => v,
        Err(e) => panic_fatal(format!("waitpid failed unexpectedly: {e}")),
    };

    let mut safe_process_trigger: Option<(String, i32)> = None;
    let mut needs_placeholder_restart = false;

    for exit in exited {
        let stage = sup.borrow().stage;
        let Some(process) = sup.borrow_mut().running.remove(exit.pid) else {
            tracing::warn!(pid = exit.pid.as_raw(), "reaped a pid the process table does not know");
            continue;
        };

        tracing::info!(
            pid = exit.pid.as_raw(),
            process = process.entry.process_name.as_str(),
            abnormal = exit.abnormal,
            "child exited"
        );

        if exit.abnormal && process.entry.entry_type.is_safe() {
            if process.entry.entry_type == EntryType::SafeMode {
                if sup.borrow().safe_mode.safe_mode_on {
                    panic_fatal("safe-mode recovery program exited abnormally");
                }
                needs_placeholder_restart = true;
            } else {
                safe_process_trigger =
                    Some((process.entry.process_name.clone(), exit.signal.unwrap_or(0)));
            }
        }

        if process.entry.entry_type.is_one_shot()
            && matches!(stage, Stage::Startup | Stage::Shutdown)
        {
            let mut guard = sup.borrow_mut();
            if let Some(remaining) = guard.remaining.as_mut() {
                remaining.pending_finish = remaining.pending_finish.saturating_sub(1);
            }
        }
    }

    // A trigger takes precedence over a bare restart: if the placeholder
    // itself died in the same drain as another safe entry, the restart
    // happens implicitly as part of delivering the trigger (open question 9).
    if let Some((process_name, signal)) = safe_process_trigger {
        trigger_safe_mode(sup, process_name, signal);
    } else if needs_placeholder_restart {
        let restarted = sup.borrow_mut().safe_mode.restart_placeholder();
        if restarted.is_err() {
            panic_fatal("could not restart safe-mode placeholder after its own death");
        }
        supervisor::sync_safe_mode_process(sup);
    }
}

/// Hands `process_name`/`signal` to the safe-mode placeholder. A failure
/// here means the placeholder is unavailable even after one restart and
/// retry (see `SafeModeState::trigger`) — supervision can no longer
/// guarantee crash recovery, so this is one of the panicking conditions.
pub fn trigger_safe_mode(sup: &SharedSupervisor, process_name: String, signal: i32) {
    let descriptor = SafeModeDescriptor { process_name, signal };
    let result = sup.borrow_mut().safe_mode.trigger(&descriptor);
    supervisor::sync_safe_mode_process(sup);
    if result.is_err() {
        panic_fatal("safe-mode placeholder unavailable even after a restart");
    }
}
