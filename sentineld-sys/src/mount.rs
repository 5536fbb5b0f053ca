//! The static pseudo-filesystem table mounted at boot, the `/etc/fstab`
//! option parser, and the shutdown-time unmount sweep.

use nix::mount::{mount, umount, MsFlags};
use sentineld_cmdline::lexer::{next_token, Token};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

pub struct MountEntry {
    pub source: Option<&'static str>,
    pub target: &'static str,
    pub fstype: &'static str,
    pub options: Option<&'static str>,
    pub flags: MsFlags,
    pub fatal: bool,
}

/// Mirrors the source's static `mount_table`: pseudo-filesystems that must
/// exist before anything else can run.
pub const MOUNT_TABLE: &[MountEntry] = &[
    MountEntry {
        source: None,
        target: "/sys",
        fstype: "sysfs",
        options: None,
        flags: MsFlags::from_bits_truncate(
            MsFlags::MS_NOSUID.bits() | MsFlags::MS_NOEXEC.bits() | MsFlags::MS_NODEV.bits(),
        ),
        fatal: true,
    },
    MountEntry {
        source: None,
        target: "/proc",
        fstype: "proc",
        options: None,
        flags: MsFlags::from_bits_truncate(
            MsFlags::MS_NOSUID.bits() | MsFlags::MS_NOEXEC.bits() | MsFlags::MS_NODEV.bits(),
        ),
        fatal: true,
    },
    MountEntry {
        source: None,
        target: "/dev",
        fstype: "devtmpfs",
        options: Some("mode=0755"),
        flags: MsFlags::from_bits_truncate(
            MsFlags::MS_NOSUID.bits() | MsFlags::MS_STRICTATIME.bits(),
        ),
        fatal: true,
    },
    MountEntry {
        source: None,
        target: "/dev/pts",
        fstype: "devpts",
        options: Some("mode=0620"),
        flags: MsFlags::from_bits_truncate(MsFlags::MS_NOSUID.bits() | MsFlags::MS_NOEXEC.bits()),
        fatal: true,
    },
    MountEntry {
        source: None,
        target: "/dev/shm",
        fstype: "tmpfs",
        options: Some("mode=1777"),
        flags: MsFlags::from_bits_truncate(
            MsFlags::MS_NOSUID.bits() | MsFlags::MS_NODEV.bits() | MsFlags::MS_STRICTATIME.bits(),
        ),
        fatal: true,
    },
    MountEntry {
        source: None,
        target: "/run",
        fstype: "tmpfs",
        options: Some("mode=0755"),
        flags: MsFlags::from_bits_truncate(
            MsFlags::MS_NOSUID.bits() | MsFlags::MS_NODEV.bits() | MsFlags::MS_STRICTATIME.bits(),
        ),
        fatal: true,
    },
    MountEntry {
        source: None,
        target: "/tmp",
        fstype: "tmpfs",
        options: None,
        flags: MsFlags::empty(),
        fatal: true,
    },
    MountEntry {
        source: None,
        target: "/sys/kernel/debug",
        fstype: "debugfs",
        options: None,
        flags: MsFlags::empty(),
        fatal: false,
    },
    MountEntry {
        source: None,
        target: "/sys/kernel/security",
        fstype: "securityfs",
        options: None,
        flags: MsFlags::from_bits_truncate(
            MsFlags::MS_NOSUID.bits() | MsFlags::MS_NOEXEC.bits() | MsFlags::MS_NODEV.bits(),
        ),
        fatal: false,
    },
];

#[derive(Debug, Error)]
pub enum MountError {
    #[error("could not create mountpoint {target}: {source}")]
    Mkdir {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not mount {target} ({fstype}): {source}")]
    Mount {
        target: String,
        fstype: String,
        #[source]
        source: nix::Error,
    },
}

fn mkdir_tolerant(target: &str) -> std::io::Result<()> {
    match fs::create_dir_all(target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Mounts every entry in [`MOUNT_TABLE`] in order. A non-fatal entry's
/// failure (or `EBUSY` on any entry) is logged and skipped.
pub fn mount_system_filesystems() -> Result<(), MountError> {
    for entry in MOUNT_TABLE {
        if let Err(e) = mkdir_tolerant(entry.target) {
            if entry.fatal {
                return Err(MountError::Mkdir {
                    target: entry.target.to_string(),
                    source: e,
                });
            }
            tracing::warn!(target = entry.target, error = %e, "non-fatal mkdir failure");
        }

        tracing::info!(
            fstype = entry.fstype,
            target = entry.target,
            options = entry.options.unwrap_or("(none)"),
            "mounting pseudo-filesystem"
        );
        let result = mount(
            entry.source,
            entry.target,
            Some(entry.fstype),
            entry.flags,
            entry.options,
        );
        if let Err(e) = result {
            if e == nix::Error::EBUSY || !entry.fatal {
                tracing::warn!(target = entry.target, error = %e, "tolerated mount failure");
            } else {
                return Err(MountError::Mount {
                    target: entry.target.to_string(),
                    fstype: entry.fstype.to_string(),
                    source: e,
                });
            }
        }
    }
    Ok(())
}

/// Maps a single fstab option token to a flag-bit adjustment. `None` means
/// the option is unrecognized and must be passed through to the
/// filesystem verbatim.
fn option_flag(opt: &str) -> Option<Box<dyn Fn(MsFlags) -> MsFlags>> {
    macro_rules! set {
        ($bit:expr) => {
            Some(Box::new(move |f: MsFlags| f | $bit))
        };
    }
    macro_rules! clear {
        ($bit:expr) => {
            Some(Box::new(move |f: MsFlags| f & !$bit))
        };
    }
    match opt {
        "defaults" => set!(MsFlags::MS_NOUSER), // rw,suid,dev,exec,auto,nouser,async
        "ro" => set!(MsFlags::MS_RDONLY),
        "rw" => clear!(MsFlags::MS_RDONLY),
        "noexec" => set!(MsFlags::MS_NOEXEC),
        "exec" => clear!(MsFlags::MS_NOEXEC),
        "nodev" => set!(MsFlags::MS_NODEV),
        "dev" => clear!(MsFlags::MS_NODEV),
        "nouser" => set!(MsFlags::MS_NOUSER),
        "user" => clear!(MsFlags::MS_NOUSER),
        "relatime" => set!(MsFlags::MS_RELATIME),
        "norelatime" => clear!(MsFlags::MS_RELATIME),
        "sync" => set!(MsFlags::MS_SYNCHRONOUS),
        "async" => clear!(MsFlags::MS_SYNCHRONOUS),
        "silent" => set!(MsFlags::MS_SILENT),
        "loud" => clear!(MsFlags::MS_SILENT),
        "noatime" => set!(MsFlags::MS_NOATIME),
        "atime" => clear!(MsFlags::MS_NOATIME),
        "strictatime" => set!(MsFlags::MS_STRICTATIME),
        "nostrictatime" => clear!(MsFlags::MS_STRICTATIME),
        "nosuid" => set!(MsFlags::MS_NOSUID),
        "suid" => clear!(MsFlags::MS_NOSUID),
        "nodiratime" => set!(MsFlags::MS_NODIRATIME),
        "diratime" => clear!(MsFlags::MS_NODIRATIME),
        "mand" => set!(MsFlags::MS_MANDLOCK),
        "nomand" => clear!(MsFlags::MS_MANDLOCK),
        "dirsync" => set!(MsFlags::MS_DIRSYNC),
        "remount" => set!(MsFlags::MS_REMOUNT),
        "nofail" => Some(Box::new(|f| f)),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum FstabOptionsError {
    #[error("mount options field is empty")]
    Empty,
    #[error("unfinished quote in mount options")]
    UnfinishedQuote,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    pub flags: MsFlags,
    pub remainder: Option<String>,
}

/// Parses a comma-delimited fstab options field (reusing the cmdline
/// lexer's quoting rules over `,` instead of ` `) into mount flags plus
/// whatever options had no direct `mount(2)` flag equivalent.
pub fn parse_fstab_mnt_options(mnt_options: &str) -> Result<ParsedOptions, FstabOptionsError> {
    if mnt_options.is_empty() {
        return Err(FstabOptionsError::Empty);
    }

    let mut flags = MsFlags::empty();
    let mut unknown: Vec<String> = Vec::new();
    let mut pos = 0usize;
    loop {
        match next_token(mnt_options, &mut pos, b',', true) {
            Ok(Token::End) => break,
            Ok(Token::Blank) => continue,
            Ok(Token::Ok(opt)) => match option_flag(&opt) {
                Some(apply) => flags = apply(flags),
                None => unknown.push(opt),
            },
            Err(_) => return Err(FstabOptionsError::UnfinishedQuote),
        }
    }

    Ok(ParsedOptions {
        flags,
        remainder: if unknown.is_empty() {
            None
        } else {
            Some(unknown.join(","))
        },
    })
}

struct FstabEntry {
    fsname: String,
    dir: String,
    fstype: String,
    opts: String,
}

fn parse_fstab_line(line: &str) -> Option<FstabEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let mut fields = trimmed.split_whitespace();
    let fsname = fields.next()?.to_string();
    let dir = fields.next()?.to_string();
    let fstype = fields.next()?.to_string();
    let opts = fields.next().unwrap_or("defaults").to_string();
    Some(FstabEntry {
        fsname,
        dir,
        fstype,
        opts,
    })
}

fn has_opt(opts: &str, name: &str) -> bool {
    opts.split(',').any(|o| o == name)
}

/// Mounts every eligible entry of `/etc/fstab`. Absence of the file is not
/// an error — it only means no user filesystem gets mounted. `noauto`
/// entries are skipped outright; `nofail` entries are skipped on failure
/// instead of aborting the whole pass.
pub fn mount_fstab_filesystems(fstab_path: &Path) -> Result<(), MountError> {
    let file = match fs::File::open(fstab_path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "could not open fstab, no user filesystem will be mounted");
            return Ok(());
        }
    };

    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "error reading fstab line, skipping rest");
                break;
            }
        };
        let Some(entry) = parse_fstab_line(&line) else {
            continue;
        };

        if has_opt(&entry.opts, "noauto") {
            continue;
        }
        let nofail = has_opt(&entry.opts, "nofail");

        let parsed = match parse_fstab_mnt_options(&entry.opts) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(dir = entry.dir.as_str(), error = %e, "could not parse fstab options");
                if nofail {
                    continue;
                }
                return Err(MountError::Mount {
                    target: entry.dir,
                    fstype: entry.fstype,
                    source: nix::Error::EINVAL,
                });
            }
        };

        if let Err(e) = mkdir_tolerant(&entry.dir) {
            tracing::warn!(dir = entry.dir.as_str(), error = %e, "could not mkdir fstab target");
            if nofail {
                continue;
            }
            return Err(MountError::Mkdir {
                target: entry.dir,
                source: e,
            });
        }

        tracing::info!(
            fstype = entry.fstype.as_str(),
            source = entry.fsname.as_str(),
            target = entry.dir.as_str(),
            "mounting fstab entry"
        );
        let result = mount(
            Some(entry.fsname.as_str()),
            entry.dir.as_str(),
            Some(entry.fstype.as_str()),
            parsed.flags,
            parsed.remainder.as_deref(),
        );
        if let Err(e) = result {
            tracing::warn!(dir = entry.dir.as_str(), error = %e, "could not mount fstab entry");
            if nofail {
                continue;
            }
            return Err(MountError::Mount {
                target: entry.dir,
                fstype: entry.fstype,
                source: e,
            });
        }
    }

    Ok(())
}

pub fn mount_mount_filesystems(fstab_path: &Path) -> Result<(), MountError> {
    mount_system_filesystems()?;
    mount_fstab_filesystems(fstab_path)
}

/// Repeatedly unmounts everything under `/proc/self/mountinfo` that isn't
/// one of the static startup targets, looping until a pass makes no
/// progress (filesystems stacked on top of others must drain first).
pub fn mount_umount_filesystems() {
    let Ok(file) = fs::File::open("/proc/self/mountinfo") else {
        tracing::warn!("could not open mountinfo, skipping unmount sweep");
        return;
    };

    let mut points: Vec<String> = Vec::new();
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        // Fields 5 (0-indexed 4) is the mount point per the mountinfo format.
        let Some(path) = line.split_whitespace().nth(4) else {
            continue;
        };
        if MOUNT_TABLE.iter().any(|m| m.target == path) {
            continue;
        }
        points.push(path.to_string());
    }

    loop {
        let mut changed = false;
        points.retain(|path| {
            tracing::info!(path = path.as_str(), "umounting");
            match umount(path.as_str()) {
                Ok(()) => {
                    changed = true;
                    false
                }
                Err(e) => {
                    tracing::warn!(path = path.as_str(), error = %e, "could not umount");
                    true
                }
            }
        });
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_option_sets_nouser_only() {
        let parsed = parse_fstab_mnt_options("defaults").unwrap();
        assert_eq!(parsed.flags, MsFlags::MS_NOUSER);
        assert!(parsed.remainder.is_none());
    }

    #[test]
    fn empty_options_field_is_rejected() {
        assert!(matches!(
            parse_fstab_mnt_options(""),
            Err(FstabOptionsError::Empty)
        ));
    }

    #[test]
    fn known_and_unknown_options_are_split() {
        let parsed = parse_fstab_mnt_options("noexec,relatime,x-systemd.after=foo").unwrap();
        assert!(parsed.flags.contains(MsFlags::MS_NOEXEC));
        assert!(parsed.flags.contains(MsFlags::MS_RELATIME));
        assert_eq!(parsed.remainder.as_deref(), Some("x-systemd.after=foo"));
    }

    #[test]
    fn negated_option_clears_a_previously_set_flag() {
        let parsed = parse_fstab_mnt_options("noexec,exec").unwrap();
        assert!(!parsed.flags.contains(MsFlags::MS_NOEXEC));
    }

    #[test]
    fn nofail_consumes_the_token_without_setting_a_flag() {
        let parsed = parse_fstab_mnt_options("nofail,ro").unwrap();
        assert!(parsed.flags.contains(MsFlags::MS_RDONLY));
        assert!(parsed.remainder.is_none());
    }

    #[test]
    fn parses_a_plain_fstab_line() {
        let entry = parse_fstab_line("/dev/sda1 /mnt ext4 defaults 0 2").unwrap();
        assert_eq!(entry.fsname, "/dev/sda1");
        assert_eq!(entry.dir, "/mnt");
        assert_eq!(entry.fstype, "ext4");
        assert_eq!(entry.opts, "defaults");
    }

    #[test]
    fn comments_and_blanks_parse_to_none() {
        assert!(parse_fstab_line("# a comment").is_none());
        assert!(parse_fstab_line("   ").is_none());
    }
}
