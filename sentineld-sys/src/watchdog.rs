//! Hardware watchdog feeder: opens `/dev/watchdog`-equivalent, reads back
//! its configured timeout, and exposes the keepalive ioctl plus the
//! "disarm on purpose" shutdown sequence. Arming a recurring timer on top
//! of [`Handle::feed`] is the caller's job (C1), mirroring the source's use
//! of `mainloop_add_timeout`.

use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

const WDIOS_DISABLECARD: libc::c_int = 0x0001;

// `linux/watchdog.h`'s ioctl numbers, all encoded under magic `'W'` exactly
// as the kernel header declares them (several are `_IOR` despite passing
// input data, a historical quirk of that header preserved here so the
// wire-level ioctl number matches the kernel's expectation).
nix::ioctl_read!(wdioc_gettimeout, b'W', 7, libc::c_int);
nix::ioctl_readwrite!(wdioc_settimeout, b'W', 6, libc::c_int);
nix::ioctl_read!(wdioc_setoptions, b'W', 4, libc::c_int);
nix::ioctl_read!(wdioc_keepalive, b'W', 5, libc::c_int);

/// An open watchdog device plus the timeout the kernel driver reported (or
/// the compiled-in default if it didn't).
pub struct Handle {
    file: File,
    pub timeout: Duration,
}

/// `0.9 * timeout`, the feed interval the source arms its keepalive timer
/// at so the device never actually expires.
pub fn feed_interval(timeout: Duration) -> Duration {
    timeout.mul_f64(0.9)
}

pub fn open(path: &Path, default_timeout: Duration) -> Option<Handle> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not open watchdog device");
            return None;
        }
    };
    let fd = file.as_raw_fd();

    let mut timeout_secs: libc::c_int = default_timeout.as_secs() as libc::c_int;
    // SAFETY: `fd` is a freshly-opened, valid watchdog descriptor.
    let got = unsafe { wdioc_gettimeout(fd, &mut timeout_secs) };
    if got.is_err() || timeout_secs < 1 {
        timeout_secs = default_timeout.as_secs() as libc::c_int;
        // SAFETY: as above.
        if unsafe { wdioc_settimeout(fd, &mut timeout_secs) }.is_err() {
            tracing::warn!(error = %Errno::last(), "could not set watchdog timeout");
            disarm(&file);
            return None;
        }
    }

    let timeout = Duration::from_secs(timeout_secs as u64);
    tracing::info!(timeout_secs, "watchdog configured");
    Some(Handle { file, timeout })
}

impl Handle {
    /// Pokes the device so it doesn't expire. A failed poke is logged, not
    /// fatal.
    pub fn feed(&self) {
        tracing::debug!("feeding watchdog");
        let mut ignored: libc::c_int = 0;
        // SAFETY: `self.file`'s descriptor stays open for `self`'s lifetime.
        if unsafe { wdioc_keepalive(self.file.as_raw_fd(), &mut ignored) }.is_err() {
            tracing::warn!(error = %Errno::last(), "could not ping watchdog");
        }
    }

    /// Disables the card and sends the magic close character, so a
    /// deliberate shutdown doesn't trip a panic.
    pub fn close(mut self, disarm_card: bool) {
        tracing::info!("closing watchdog");
        if disarm_card {
            disarm(&self.file);
            if let Err(e) = self.file.write_all(b"V") {
                tracing::warn!(error = %e, "could not send magic character to watchdog");
            }
        }
    }
}

fn disarm(file: &File) {
    let mut flags: libc::c_int = WDIOS_DISABLECARD;
    // SAFETY: `file`'s descriptor is open for the duration of this call.
    if unsafe { wdioc_setoptions(file.as_raw_fd(), &mut flags) }.is_err() {
        tracing::warn!(error = %Errno::last(), "could not disable watchdog");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_interval_is_nine_tenths_of_timeout() {
        let interval = feed_interval(Duration::from_secs(60));
        assert_eq!(interval, Duration::from_millis(54_000));
    }

    #[test]
    fn opening_a_missing_device_returns_none_without_panicking() {
        assert!(open(Path::new("/dev/does-not-exist-watchdog"), Duration::from_secs(60)).is_none());
    }
}
