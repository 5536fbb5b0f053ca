//! Lazily-opened, append-only log sink on a device path, wired into
//! `tracing-subscriber` as a `MakeWriter` so every supervisory decision ends
//! up on the same device the original `log_message` wrote to.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A single append-only descriptor, opened on first use and cached forever
/// after — including a failed open, matching the source's `log_fd()`: once
/// opening fails there is no retry on the next call.
pub struct LogSink {
    path: PathBuf,
    file: Mutex<Option<Option<File>>>,
}

/// Cheaply cloneable handle shared between `main` and the `tracing`
/// formatting layer.
#[derive(Clone)]
pub struct SharedLogSink(Arc<LogSink>);

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn shared(path: impl Into<PathBuf>) -> SharedLogSink {
        SharedLogSink(Arc::new(Self::new(path)))
    }

    fn ensure_open<'a>(&self, slot: &'a mut Option<Option<File>>) -> &'a mut Option<File> {
        if slot.is_none() {
            let opened = OpenOptions::new()
                .write(true)
                .create(true)
                .custom_flags(libc::O_NOCTTY | libc::O_SYNC)
                .open(&self.path)
                .ok();
            *slot = Some(opened);
        }
        // Just set to `Some` above if it was `None`.
        #[allow(clippy::expect_used)]
        slot.as_mut().expect("just initialized above")
    }

    fn write_preserving_errno(&self, buf: &[u8]) -> io::Result<usize> {
        let errno_before = nix::errno::Errno::last_raw();
        let result = (|| {
            let mut slot = self
                .file
                .lock()
                .map_err(|_| io::Error::other("log sink lock poisoned"))?;
            match self.ensure_open(&mut slot) {
                Some(f) => f.write(buf),
                // No device available: swallow the write, same as the
                // source returning -1 from `log_fd()` forever after.
                None => Ok(buf.len()),
            }
        })();
        nix::errno::Errno::set_raw(errno_before);
        result
    }
}

impl Write for SharedLogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_preserving_errno(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl tracing_subscriber::fmt::MakeWriter<'_> for SharedLogSink {
    type Writer = SharedLogSink;

    fn make_writer(&self) -> Self::Writer {
        self.clone()
    }
}

pub fn default_path() -> &'static Path {
    Path::new("/dev/ttyS1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_to_a_regular_file_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let mut sink = LogSink::shared(&path);
        sink.write_all(b"hello\n").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn a_failed_open_is_cached_and_does_not_error_the_caller() {
        let mut sink = LogSink::shared("/nonexistent-dir/that/cannot/be/created/log");
        // Matches the source: failure to open just means the write is a
        // silent no-op, never an error surfaced to the caller.
        assert!(sink.write_all(b"dropped").is_ok());
    }

    #[test]
    fn clones_share_the_same_underlying_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let sink = LogSink::shared(&path);
        let mut a = sink.clone();
        let mut b = sink.clone();
        a.write_all(b"a").unwrap();
        b.write_all(b"b").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ab");
    }
}
