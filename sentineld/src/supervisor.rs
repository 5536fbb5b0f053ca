//! The state machine itself (C4): the six stages, the running set, the
//! current wave cursor, and the safe-mode lifecycle, all gathered behind
//! one owning context threaded explicitly through every callback rather
//! than kept as module-level state (Design Note 9) — this is what lets
//! the scheduler be driven from a test without a real `epoll` loop.
//! Grounded on the source's stage table and `main()`/`stage_maintenance`.

use crate::config::Config;
use crate::eventloop::{Handle as TimerHandle, SharedEventLoop, TimerResult};
use crate::process::{Process, RunningSet};
use crate::safemode::SafeModeState;
use sentineld_inittab::entry::InittabEntry;
use sentineld_sys::watchdog;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Startup,
    Run,
    Termination,
    Shutdown,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCommand {
    Reboot,
    Halt,
    PowerOff,
}

impl Default for ShutdownCommand {
    fn default() -> Self {
        Self::Reboot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Startup,
    Shutdown,
}

/// The scheduler's cursor into the list it is currently running: where
/// the next unscheduled wave begins, and how many of the current wave's
/// one-shot entries have not yet exited.
#[derive(Debug, Clone, Copy)]
pub struct Remaining {
    pub list: ListKind,
    pub index: usize,
    pub pending_finish: u32,
}

pub struct Supervisor {
    pub config: Config,
    pub stage: Stage,
    pub running: RunningSet,
    pub startup_list: Vec<InittabEntry>,
    pub shutdown_list: Vec<InittabEntry>,
    pub remaining: Option<Remaining>,
    pub safe_mode: SafeModeState,
    /// Kept so a freshly-forked placeholder can be re-inserted into
    /// `running` under the same entry after every restart.
    pub safe_mode_entry: InittabEntry,
    pub event_loop: SharedEventLoop,
    pub watchdog: Option<watchdog::Handle>,
    pub kill_timer: Option<TimerHandle>,
    pub one_shot_timer: Option<TimerHandle>,
    pub shutdown_command: ShutdownCommand,
}

pub type SharedSupervisor = Rc<RefCell<Supervisor>>;

impl Supervisor {
    pub fn list(&self, kind: ListKind) -> &[InittabEntry] {
        match kind {
            ListKind::Startup => &self.startup_list,
            ListKind::Shutdown => &self.shutdown_list,
        }
    }
}

/// Re-inserts the current safe-mode placeholder pid into `running` under
/// `safe_mode_entry` if it is not already there, restoring
/// `|{p∈running: type==SafeMode}|==1` after a fork at start-up or after any
/// placeholder restart. Mirrors the source's `setup_safe_mode`, which
/// pushes the placeholder onto `running_processes` on every such path.
pub fn sync_safe_mode_process(sup: &SharedSupervisor) {
    let mut guard = sup.borrow_mut();
    if guard.running.find_safe_mode().is_some() {
        return;
    }
    let pid = guard.safe_mode.placeholder_pid();
    let entry = guard.safe_mode_entry.clone();
    guard.running.insert(Process { pid, entry });
}

pub fn cancel_one_shot_timer(sup: &SharedSupervisor) {
    let handle = sup.borrow_mut().one_shot_timer.take();
    if let Some(handle) = handle {
        sup.borrow().event_loop.borrow_mut().remove_timer(handle);
    }
}

pub fn cancel_kill_timer(sup: &SharedSupervisor) {
    let handle = sup.borrow_mut().kill_timer.take();
    if let Some(handle) = handle {
        sup.borrow().event_loop.borrow_mut().remove_timer(handle);
    }
}

/// Entry action for `Run`: detach the post-iteration hook so the
/// multiplexer is purely idle until a shutdown signal re-attaches it.
pub fn transition_to_run(sup: &SharedSupervisor) {
    sup.borrow_mut().stage = Stage::Run;
    sup.borrow()
        .event_loop
        .borrow_mut()
        .set_post_iteration_callback(None);
    tracing::info!("startup complete, entering run stage");
}

/// Entry action for `Shutdown`: start the shutdown_list waves, or skip
/// straight to `Close` if there is nothing to run.
pub fn transition_to_shutdown(sup: &SharedSupervisor) {
    cancel_kill_timer(sup);
    sup.borrow_mut().stage = Stage::Shutdown;
    let empty = sup.borrow().shutdown_list.is_empty();
    if empty {
        transition_to_close(sup);
    } else {
        crate::scheduler::start_processes(sup, ListKind::Shutdown, 0);
    }
}

/// Entry action for `Close`: ask the multiplexer to stop after this
/// iteration.
pub fn transition_to_close(sup: &SharedSupervisor) {
    sup.borrow_mut().stage = Stage::Close;
    sup.borrow().event_loop.borrow_mut().exit();
    tracing::info!("shutdown complete, closing down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_command_defaults_to_reboot() {
        assert_eq!(ShutdownCommand::default(), ShutdownCommand::Reboot);
    }
}
