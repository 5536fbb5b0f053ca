//! The ordered-wave scheduler (C4 core): groups the startup/shutdown
//! lists by `order`, fires every entry in a wave, and only advances past
//! a wave once its one-shots have all exited — unless the wave contains
//! no one-shots at all, in which case it never stalls. Grounded on the
//! source's `start_processes`/`stage_maintenance` in `main.c`.

use crate::eventloop::TimerResult;
use crate::process::Process;
use crate::spawn::{self, SpawnOutcome};
use crate::supervisor::{
    transition_to_close, transition_to_run, Remaining, SharedSupervisor, Stage,
};
use crate::{reaper, supervisor};
use sentineld_inittab::entry::InittabEntry;

/// Runs waves from `list[start_index..]` until one needs to wait for
/// one-shots to finish, or the list is exhausted. May run several waves
/// in the same call (the services-only no-stall rule), so `start_index`
/// is not necessarily where the *next* call should resume — `remaining`
/// on the supervisor is the source of truth for that.
pub fn start_processes(
    sup: &SharedSupervisor,
    list: supervisor::ListKind,
    start_index: usize,
) {
    let entries: Vec<InittabEntry> = sup.borrow().list(list).to_vec();
    let log_device = sup.borrow().config.log_device.clone();
    let mut index = start_index;

    loop {
        if index >= entries.len() {
            sup.borrow_mut().remaining = None;
            return;
        }

        let current_order = entries[index].order_key();
        let mut pending_finish = 0u32;
        let mut has_one_shot = false;

        while index < entries.len() && entries[index].order_key() == current_order {
            let entry = entries[index].clone();
            index += 1;

            match spawn::spawn_exec(&entry, &log_device) {
                SpawnOutcome::Spawned(pid) => {
                    if entry.entry_type.is_one_shot() {
                        has_one_shot = true;
                        pending_finish += 1;
                    }
                    sup.borrow_mut().running.insert(Process { pid, entry });
                }
                SpawnOutcome::ForkFailed => {
                    if entry.entry_type.is_safe() {
                        reaper::trigger_safe_mode(sup, entry.process_name.clone(), -1);
                    }
                }
            }
        }

        if has_one_shot {
            arm_one_shot_timer(sup);
            sup.borrow_mut().remaining = Some(Remaining { list, index, pending_finish });
            return;
        }

        // A services-only wave never blocks progress to the next order.
    }
}

fn arm_one_shot_timer(sup: &SharedSupervisor) {
    let supervisor = sup.clone();
    let (event_loop, timeout) = {
        let guard = sup.borrow();
        (guard.event_loop.clone(), guard.config.one_shot_timeout)
    };
    let callback = Box::new(move || {
        let pending = supervisor
            .borrow()
            .remaining
            .as_ref()
            .map(|r| r.pending_finish)
            .unwrap_or(0);
        if pending > 0 {
            tracing::warn!(pending, "one-shot wave timed out with entries still running");
        }
        TimerResult::Stop
    });
    match event_loop.borrow_mut().add_timer(timeout, callback) {
        Ok(handle) => sup.borrow_mut().one_shot_timer = Some(handle),
        Err(e) => tracing::error!(error = %e, "could not arm one-shot wave timer"),
    }
}

/// The post-iteration hook attached for the whole `Startup`/`Termination`/
/// `Shutdown` span: advances the wave cursor once its one-shots have all
/// reported in, and drives the stage transitions at the ends of the
/// startup and shutdown lists.
pub fn stage_maintenance(sup: &SharedSupervisor) {
    let stage = sup.borrow().stage;
    match stage {
        Stage::Startup | Stage::Shutdown => {
            let pending = sup
                .borrow()
                .remaining
                .as_ref()
                .map(|r| r.pending_finish)
                .unwrap_or(0);
            if pending != 0 {
                return;
            }
            supervisor::cancel_one_shot_timer(sup);
            let remaining = sup.borrow_mut().remaining.take();
            match remaining {
                Some(r) => start_processes(sup, r.list, r.index),
                None if stage == Stage::Startup => transition_to_run(sup),
                None => transition_to_close(sup),
            }
        }
        Stage::Termination => {
            // Everything but the safe-mode placeholder has been asked to
            // exit; once it's the last one left, proceed to Shutdown.
            if sup.borrow().running.len() <= 1 {
                supervisor::transition_to_shutdown(sup);
            }
        }
        Stage::Setup | Stage::Run | Stage::Close => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentineld_inittab::entry::EntryType;

    fn entry(order: u32, entry_type: EntryType) -> InittabEntry {
        InittabEntry {
            order: Some(order),
            core_id: None,
            entry_type,
            ctty_path: String::new(),
            process_name: "/bin/true".into(),
        }
    }

    #[test]
    fn waves_group_by_order_key() {
        let a = entry(0, EntryType::Service);
        let b = entry(0, EntryType::Service);
        let c = entry(1, EntryType::Service);
        assert_eq!(a.order_key(), b.order_key());
        assert_ne!(a.order_key(), c.order_key());
    }
}
