//! Translation entries and the two page-table configurations.

use bitflags::bitflags;

use crate::types::Tid;

bitflags! {
    /// Status bits of a translation entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        /// The mapping is usable.
        const VALID = 1 << 0;
        /// Referenced since the bit was last cleared.
        const USE = 1 << 1;
        /// Written since the page was last loaded or cleaned.
        const DIRTY = 1 << 2;
        /// Writes raise an address error.
        const READ_ONLY = 1 << 3;
    }
}

/// One virtual-to-physical translation. Used both for per-process
/// page-table entries (indexed by virtual page), for inverted-table
/// entries (indexed by physical frame, tagged with the owner), and for
/// the TLB's cached copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    pub vpn: usize,
    pub ppn: usize,
    pub flags: PteFlags,
    /// Monotonic reference stamp; larger means more recently used.
    pub lru_record: u64,
    /// Owning thread, meaningful in the inverted configuration.
    pub tid: Tid,
}

impl TranslationEntry {
    pub fn invalid() -> Self {
        Self {
            vpn: 0,
            ppn: 0,
            flags: PteFlags::empty(),
            lru_record: 0,
            tid: Tid(u32::MAX),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(PteFlags::VALID)
    }
}

/// Which translation structure the kernel maintains. The original system
/// selected this at compile time; here it is a runtime choice so both
/// configurations stay testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationMode {
    /// One table per address space, indexed by virtual page.
    PerProcess,
    /// One kernel-wide table indexed by physical frame, keyed `(tid, vpn)`.
    Inverted,
}
