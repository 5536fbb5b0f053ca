//! Controlling-terminal setup: opening a tty with bounded `EIO` retries,
//! resetting it to a sane canonical-mode termios, and granting it as the
//! calling process's controlling terminal via `TIOCSCTTY`.

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices as SCI,
    Termios,
};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

const OPEN_RETRIES: u32 = 10;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

// `<sys/ttydefaults.h>` default control characters: `libc` only binds the
// `V*` index constants, not these, so they are defined locally.
const CINTR: libc::cc_t = 0o003;
const CQUIT: libc::cc_t = 0o034;
const CERASE: libc::cc_t = 0o177;
const CKILL: libc::cc_t = 0o025;
const CEOF: libc::cc_t = 0o004;
const CSTART: libc::cc_t = 0o021;
const CSTOP: libc::cc_t = 0o023;
const CSUSP: libc::cc_t = 0o032;
const CREPRINT: libc::cc_t = 0o022;
const CWERASE: libc::cc_t = 0o027;
const CLNEXT: libc::cc_t = 0o026;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("could not open console device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: Errno,
    },
    #[error("tcgetattr failed: {0}")]
    GetAttr(Errno),
    #[error("tcsetattr failed: {0}")]
    SetAttr(Errno),
    #[error("tcflush failed: {0}")]
    Flush(Errno),
    #[error("TIOCSCTTY failed: {0}")]
    SetControllingTty(Errno),
}

/// Opens `path`, retrying up to [`OPEN_RETRIES`] times at [`OPEN_RETRY_DELAY`]
/// apart on `EIO` (a device that is momentarily not ready), matching the
/// source's `open_console`.
pub fn open_console(path: &Path, flags: OFlag) -> Result<OwnedFd, ConsoleError> {
    let mut attempts_left = OPEN_RETRIES;
    loop {
        match open(path, flags, Mode::empty()) {
            Ok(fd) => return Ok(fd),
            Err(Errno::EIO) if attempts_left > 1 => {
                attempts_left -= 1;
                sleep(OPEN_RETRY_DELAY);
            }
            Err(e) => {
                return Err(ConsoleError::Open {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        }
    }
}

/// Resets `fd`'s termios to canonical mode with the system default control
/// characters, matching the source's `reset_console`. See spec §6.5.
pub fn reset_console(fd: RawFd) -> Result<(), ConsoleError> {
    let mut tty = Termios::from_fd(fd).map_err(ConsoleError::GetAttr)?;

    let keep = ControlFlags::CBAUD
        | ControlFlags::CBAUDEX
        | ControlFlags::CSIZE
        | ControlFlags::CSTOPB
        | ControlFlags::PARENB
        | ControlFlags::PARODD;
    tty.control_flags &= keep;
    tty.control_flags |= ControlFlags::HUPCL | ControlFlags::CLOCAL | ControlFlags::CREAD;

    tty.input_flags = InputFlags::IGNPAR | InputFlags::ICRNL | InputFlags::IXON | InputFlags::IXANY;
    tty.output_flags = OutputFlags::OPOST | OutputFlags::ONLCR;
    tty.local_flags = LocalFlags::ISIG
        | LocalFlags::ICANON
        | LocalFlags::ECHO
        | LocalFlags::ECHOCTL
        | LocalFlags::ECHOPRT
        | LocalFlags::ECHOKE;

    tty.control_chars[SCI::VINTR as usize] = CINTR;
    tty.control_chars[SCI::VQUIT as usize] = CQUIT;
    tty.control_chars[SCI::VERASE as usize] = CERASE;
    tty.control_chars[SCI::VKILL as usize] = CKILL;
    tty.control_chars[SCI::VEOF as usize] = CEOF;
    tty.control_chars[SCI::VTIME as usize] = 0;
    tty.control_chars[SCI::VMIN as usize] = 1;
    tty.control_chars[SCI::VSTART as usize] = CSTART;
    tty.control_chars[SCI::VSTOP as usize] = CSTOP;
    tty.control_chars[SCI::VSUSP as usize] = CSUSP;
    tty.control_chars[SCI::VEOL as usize] = libc::_POSIX_VDISABLE;
    tty.control_chars[SCI::VREPRINT as usize] = CREPRINT;
    tty.control_chars[SCI::VWERASE as usize] = CWERASE;
    tty.control_chars[SCI::VLNEXT as usize] = CLNEXT;
    tty.control_chars[SCI::VEOL2 as usize] = libc::_POSIX_VDISABLE;

    nix::sys::termios::tcsetattr(fd, SetArg::TCSANOW, &tty).map_err(ConsoleError::SetAttr)?;
    nix::sys::termios::tcflush(fd, nix::sys::termios::FlushArg::TCIOFLUSH)
        .map_err(ConsoleError::Flush)?;
    Ok(())
}

/// Grants the controlling terminal on `fd` (expected to already be dup'ed
/// onto stdin) via `TIOCSCTTY`.
pub fn set_controlling_tty(fd: RawFd) -> Result<(), ConsoleError> {
    // SAFETY: `fd` is a valid, open terminal descriptor for the duration of
    // this call; TIOCSCTTY takes an ignored third argument by convention.
    let r = unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0) };
    if r == -1 {
        return Err(ConsoleError::SetControllingTty(Errno::last()));
    }
    Ok(())
}

/// Opens and resets `/dev/console`-equivalent for PID 1's own stdio, closing
/// the descriptor afterward (stdio for the supervisor itself is otherwise
/// unused once the log sink takes over).
pub fn setup_boot_console(path: &Path) -> Result<(), ConsoleError> {
    let fd = open_console(path, OFlag::O_WRONLY | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)?;
    reset_console(fd.as_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_a_missing_device_surfaces_the_errno() {
        let err = open_console(Path::new("/nonexistent/console-device"), OFlag::O_RDONLY)
            .unwrap_err();
        assert!(matches!(err, ConsoleError::Open { .. }));
    }
}
