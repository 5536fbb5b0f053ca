//! Prepares a C-compatible argv/envp for `execve` ahead of time, so the
//! only work left to do between `fork` and `exec` is a single syscall.

use nix::errno::Errno;
use std::ffi::CString;

#[allow(dead_code)]
#[derive(Debug)]
pub struct PreparedExecve {
    binary_path: CString,
    args_cstrings: Vec<CString>,
    args_ptrs: Vec<*const libc::c_char>,
    env_cstrings: Vec<CString>,
    env_ptrs: Vec<*const libc::c_char>,
}

#[derive(Debug, thiserror::Error)]
pub enum PreparedExecveError {
    #[error("binary path contains an interior NUL: {0}")]
    BinaryPath(std::ffi::NulError),
    #[error("argument contains an interior NUL: {0}")]
    Argument(std::ffi::NulError),
    #[error("environment entry contains an interior NUL: {0}")]
    Environment(std::ffi::NulError),
}

impl PreparedExecve {
    /// `env` entries are already-formatted `KEY=VALUE` strings, as produced
    /// by the cmdline tokenizer.
    pub fn new(
        binary_path: &str,
        args: &[String],
        env: &[String],
    ) -> Result<Self, PreparedExecveError> {
        let binary_path = CString::new(binary_path).map_err(PreparedExecveError::BinaryPath)?;

        let args_cstrings: Vec<CString> = args
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<_, _>>()
            .map_err(PreparedExecveError::Argument)?;
        let args_ptrs: Vec<*const libc::c_char> = args_cstrings
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let env_cstrings: Vec<CString> = env
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<_, _>>()
            .map_err(PreparedExecveError::Environment)?;
        let env_ptrs: Vec<*const libc::c_char> = env_cstrings
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            binary_path,
            args_cstrings,
            args_ptrs,
            env_cstrings,
            env_ptrs,
        })
    }

    /// Calls `execvpe` on the prepared arguments: `execvpe` rather than
    /// `execve` so a bare program name resolves against `PATH`, matching
    /// the original supervisor's own spawn semantics.
    pub fn exec(&self) -> Errno {
        unsafe {
            libc::execvpe(
                self.binary_path.as_ptr(),
                self.args_ptrs.as_ptr(),
                self.env_ptrs.as_ptr(),
            );
        }
        Errno::last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_successfully_for_ordinary_input() {
        let prepared = PreparedExecve::new(
            "/bin/echo",
            &["/bin/echo".to_string(), "hi".to_string()],
            &["PATH=/bin".to_string()],
        )
        .unwrap();
        assert!(std::mem::size_of_val(&prepared) > 0);
    }

    #[test]
    fn rejects_interior_nul_in_binary_path() {
        let err = PreparedExecve::new("/bin/ec\0ho", &[], &[]).unwrap_err();
        assert!(matches!(err, PreparedExecveError::BinaryPath(_)));
    }

    #[test]
    fn rejects_interior_nul_in_argument() {
        let err =
            PreparedExecve::new("/bin/echo", &["a\0b".to_string()], &[]).unwrap_err();
        assert!(matches!(err, PreparedExecveError::Argument(_)));
    }

    #[test]
    fn rejects_interior_nul_in_environment() {
        let err =
            PreparedExecve::new("/bin/echo", &[], &["A=b\0c".to_string()]).unwrap_err();
        assert!(matches!(err, PreparedExecveError::Environment(_)));
    }
}
