//! The inittab data model: entry types, their predicates, and a single
//! parsed entry.

/// The seven kinds of line an inittab file can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    OneShot,
    SafeOneShot,
    Service,
    SafeService,
    Shutdown,
    SafeShutdown,
    SafeMode,
}

impl EntryType {
    pub const fn from_tag(tag: &str) -> Option<Self> {
        match tag.as_bytes() {
            b"<one-shot>" => Some(Self::OneShot),
            b"<safe-one-shot>" => Some(Self::SafeOneShot),
            b"<service>" => Some(Self::Service),
            b"<safe-service>" => Some(Self::SafeService),
            b"<shutdown>" => Some(Self::Shutdown),
            b"<safe-shutdown>" => Some(Self::SafeShutdown),
            b"<safe-mode>" => Some(Self::SafeMode),
            _ => None,
        }
    }

    /// Abnormal death of a process carrying one of these types must be
    /// reported to the safe-mode placeholder.
    pub const fn is_safe(self) -> bool {
        matches!(
            self,
            Self::SafeOneShot | Self::SafeService | Self::SafeShutdown | Self::SafeMode
        )
    }

    pub const fn is_startup(self) -> bool {
        matches!(
            self,
            Self::OneShot | Self::SafeOneShot | Self::Service | Self::SafeService
        )
    }

    pub const fn is_service(self) -> bool {
        matches!(self, Self::Service | Self::SafeService)
    }

    pub const fn is_shutdown(self) -> bool {
        matches!(self, Self::Shutdown | Self::SafeShutdown)
    }

    /// Expected to exit within a bounded time; the scheduler waits for
    /// every one-shot in a wave before advancing to the next one.
    pub const fn is_one_shot(self) -> bool {
        matches!(
            self,
            Self::OneShot | Self::SafeOneShot | Self::Shutdown | Self::SafeShutdown
        )
    }
}

/// Maximum length of the `process` field, mirroring the original's
/// `char process_name[4096]` (one byte reserved for the NUL terminator).
pub const PROCESS_NAME_MAX: usize = 4095;
/// Maximum length of the `ctty` field, mirroring `char ctty_path[256]`.
pub const CTTY_PATH_MAX: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InittabEntry {
    /// Wave number; `None` only for the `SafeMode` entry.
    pub order: Option<u32>,
    /// CPU affinity pin; `None` means "no affinity restriction".
    pub core_id: Option<u32>,
    pub entry_type: EntryType,
    /// Controlling terminal path; empty means "inherit stdio".
    pub ctty_path: String,
    /// The raw `process` field, tokenized later by `sentineld-cmdline`.
    pub process_name: String,
}

impl InittabEntry {
    pub fn order_key(&self) -> u32 {
        self.order.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        assert_eq!(EntryType::from_tag("<service>"), Some(EntryType::Service));
        assert_eq!(EntryType::from_tag("<bogus>"), None);
    }

    #[test]
    fn predicates_match_source_table() {
        assert!(EntryType::SafeMode.is_safe());
        assert!(!EntryType::Service.is_safe());
        assert!(EntryType::Service.is_startup());
        assert!(!EntryType::Shutdown.is_startup());
        assert!(EntryType::Shutdown.is_shutdown());
        assert!(EntryType::SafeOneShot.is_one_shot());
        assert!(!EntryType::Service.is_one_shot());
        assert!(EntryType::SafeService.is_service());
    }
}
