//! Supervision-impairing errors (spec §7 kind 3): logged, then the process
//! exits immediately rather than unwinding. `_exit`-style rather than
//! `panic!`, since a caught unwind is not a recovery option for PID 1.

/// Logs `message` and terminates the process with status 1. Never returns.
pub fn panic_fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!("Panicking: {message}");
    std::process::exit(1);
}
