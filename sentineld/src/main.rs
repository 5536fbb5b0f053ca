//! Boot sequence: mount, console, signal masks, the safe-mode placeholder,
//! then the first startup wave — followed by the single blocking call into
//! the event multiplexer. Grounded on the source's `main()`.

use anyhow::{Context, Result};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::sys::signal::Signal;
use sentineld::config::Config;
use sentineld::eventloop::{EventLoop, SignalEvent, TimerResult};
use sentineld::process::RunningSet;
use sentineld::safemode::SafeModeState;
use sentineld::supervisor::{ListKind, ShutdownCommand, Stage, Supervisor};
use sentineld::{reaper, scheduler, shutdown};
use sentineld_sys::{console, log as logsink, mount, watchdog};
use std::cell::RefCell;
use std::rc::Rc;

fn main() {
    let config = Config::from_env();
    init_logging(&config);

    match run(config) {
        Ok(()) => unreachable!("run() only returns through finalize(), which never returns"),
        Err(e) => {
            tracing::error!(error = %e, "fatal error during startup, cannot continue as PID 1");
            std::process::exit(1);
        }
    }
}

fn init_logging(config: &Config) {
    let sink = logsink::LogSink::shared(config.log_device.clone());
    tracing_subscriber::fmt()
        .with_writer(sink)
        .with_ansi(false)
        .with_target(false)
        .init();
}

/// Never returns on success: the only way out is through
/// [`shutdown::finalize`], which itself never returns. Any `Err` here is a
/// configuration-stage failure (spec §7 kind 1) and aborts program start.
fn run(config: Config) -> Result<()> {
    mount::mount_mount_filesystems(&config.fstab_path).context("mounting filesystems")?;

    if let Err(e) = console::setup_boot_console(&config.console_path) {
        tracing::warn!(error = %e, "could not set up boot console, continuing without one");
    }

    disable_ctrl_alt_del();

    let inittab = sentineld_inittab::load(&config.inittab_path).context("loading inittab")?;
    let safe_mode_entry = inittab
        .safe_mode_entry
        .clone()
        .context("inittab has no <safe-mode> entry")?;

    let event_loop = EventLoop::shared().context("creating event multiplexer")?;

    let signal_mask = block_supervisor_signals().context("blocking supervisor signals")?;

    let safe_mode =
        SafeModeState::start(safe_mode_entry.process_name.clone()).context("forking safe-mode placeholder")?;

    let watchdog_handle = watchdog::open(&config.watchdog_path, config.watchdog_timeout_default);

    let supervisor = Rc::new(RefCell::new(Supervisor {
        config: config.clone(),
        stage: Stage::Setup,
        running: RunningSet::new(),
        startup_list: inittab.startup_list,
        shutdown_list: inittab.shutdown_list,
        remaining: None,
        safe_mode,
        safe_mode_entry,
        event_loop: event_loop.clone(),
        watchdog: watchdog_handle,
        kill_timer: None,
        one_shot_timer: None,
        shutdown_command: ShutdownCommand::default(),
    }));
    sentineld::supervisor::sync_safe_mode_process(&supervisor);

    arm_watchdog_feed(&supervisor);
    register_signal_source(&supervisor, signal_mask).context("registering signal source")?;

    supervisor.borrow_mut().stage = Stage::Startup;
    {
        let hook_target = supervisor.clone();
        event_loop
            .borrow_mut()
            .set_post_iteration_callback(Some(Box::new(move || {
                scheduler::stage_maintenance(&hook_target);
            })));
    }
    scheduler::start_processes(&supervisor, ListKind::Startup, 0);

    sentineld::eventloop::start(&event_loop).context("event multiplexer failed")?;

    shutdown::finalize(&supervisor)
}

/// `SIGINT`/Ctrl-Alt-Del is disabled at the kernel level entirely rather
/// than handled: PID 1 has no use for it and `/proc/sys/kernel/sysrq` is
/// silenced the same way, matching spec §6.4.
fn disable_ctrl_alt_del() {
    if let Err(e) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_DISABLE_CAD) {
        tracing::warn!(error = %e, "could not disable ctrl-alt-del");
    }
    if let Err(e) = std::fs::write("/proc/sys/kernel/sysrq", b"0") {
        tracing::warn!(error = %e, "could not disable sysrq");
    }
}

/// Blocks `SIGCHLD`/`SIGTERM`/`SIGUSR1`/`SIGUSR2` on the calling thread so
/// their only delivery path is the signalfd registered over the same mask;
/// returns that mask for the caller to hand to
/// [`EventLoop::add_signal_source`].
fn block_supervisor_signals() -> Result<SigSet> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGUSR1);
    mask.add(Signal::SIGUSR2);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
    Ok(mask)
}

fn register_signal_source(
    supervisor: &sentineld::supervisor::SharedSupervisor,
    mask: SigSet,
) -> Result<()> {
    let callback_target = supervisor.clone();
    let callback = Box::new(move |event: SignalEvent| {
        if event.signo == libc::SIGCHLD {
            reaper::handle_sigchld(&callback_target);
        } else {
            shutdown::handle_shutdown_signal(&callback_target, event.signo);
        }
    });

    let event_loop = supervisor.borrow().event_loop.clone();
    event_loop
        .borrow_mut()
        .add_signal_source(&mask, callback)
        .map(|_handle| ())
        .context("could not register signal source")
}

fn arm_watchdog_feed(supervisor: &sentineld::supervisor::SharedSupervisor) {
    let interval = {
        let guard = supervisor.borrow();
        let Some(handle) = guard.watchdog.as_ref() else {
            return;
        };
        watchdog::feed_interval(handle.timeout)
    };
    let event_loop = supervisor.borrow().event_loop.clone();
    let callback_target = supervisor.clone();
    let callback = Box::new(move || {
        if let Some(handle) = callback_target.borrow().watchdog.as_ref() {
            handle.feed();
        }
        TimerResult::Continue
    });
    if let Err(e) = event_loop.borrow_mut().add_timer(interval, callback) {
        tracing::warn!(error = %e, "could not arm watchdog feed timer");
    }
}
