//! Virtual memory: translation tables, TLB refill policies, demand
//! paging and address spaces.

pub mod addr_space;
pub mod page_table;
pub mod pager;
pub mod tlb;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::types::Tid;
use crate::utilities::Bitmap;
use crate::Kernel;
use page_table::{PteFlags, TranslationEntry, TranslationMode};

/// Paging activity counters, for diagnostics and tests.
#[derive(Debug, Default)]
pub struct VmStats {
    pub page_faults: AtomicU64,
    pub swap_reads: AtomicU64,
    pub swap_writes: AtomicU64,
}

impl VmStats {
    pub fn page_faults(&self) -> u64 {
        self.page_faults.load(Ordering::SeqCst)
    }

    pub fn swap_reads(&self) -> u64 {
        self.swap_reads.load(Ordering::SeqCst)
    }

    pub fn swap_writes(&self) -> u64 {
        self.swap_writes.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct VmInner {
    frames: Bitmap,
    ipt: Vec<TranslationEntry>,
}

/// Kernel-wide paging state: the physical frame pool and, in the
/// inverted configuration, the frame-indexed translation table.
#[derive(Debug)]
pub struct VmState {
    mode: TranslationMode,
    inner: Mutex<VmInner>,
    pub stats: VmStats,
}

impl VmState {
    pub(crate) fn new(mode: TranslationMode, num_phys_pages: usize) -> Self {
        Self {
            mode,
            inner: Mutex::new(VmInner {
                frames: Bitmap::new(num_phys_pages),
                ipt: vec![TranslationEntry::invalid(); num_phys_pages],
            }),
            stats: VmStats::default(),
        }
    }

    pub fn mode(&self) -> TranslationMode {
        self.mode
    }

    /// Claim an unused physical frame, if one exists.
    pub(crate) fn allocate_frame(&self) -> Option<usize> {
        self.inner.lock().frames.find()
    }

    pub(crate) fn release_frame(&self, ppn: usize) {
        self.inner.lock().frames.clear(ppn);
    }

    pub fn free_frames(&self) -> usize {
        self.inner.lock().frames.num_clear()
    }

    // ========================================================================
    // Inverted-table access
    // ========================================================================

    pub(crate) fn ipt_entry(&self, ppn: usize) -> TranslationEntry {
        self.inner.lock().ipt[ppn]
    }

    pub(crate) fn ipt_set(&self, ppn: usize, entry: TranslationEntry) {
        self.inner.lock().ipt[ppn] = entry;
    }

    /// Frame holding `(tid, vpn)`, if mapped.
    pub(crate) fn ipt_find(&self, tid: Tid, vpn: usize) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .ipt
            .iter()
            .position(|e| e.is_valid() && e.tid == tid && e.vpn == vpn)
    }

    /// Globally least-recently-stamped valid frame.
    pub(crate) fn ipt_lru_victim(&self) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .ipt
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_valid())
            .min_by_key(|(_, e)| e.lru_record)
            .map(|(ppn, _)| ppn)
    }

    /// Tear every mapping owned by `tid` out of the inverted table,
    /// returning the freed frames.
    pub(crate) fn ipt_evict_tid(&self, tid: Tid) -> Vec<usize> {
        let mut inner = self.inner.lock();
        let mut freed = Vec::new();
        for ppn in 0..inner.ipt.len() {
            if inner.ipt[ppn].is_valid() && inner.ipt[ppn].tid == tid {
                inner.ipt[ppn] = TranslationEntry::invalid();
                freed.push(ppn);
            }
        }
        freed
    }

    // ========================================================================
    // TLB write-back
    // ========================================================================

    /// Merge the reference/dirty/recency state of a TLB copy back into
    /// the authoritative table entry it was filled from.
    pub(crate) fn propagate(&self, kernel: &Kernel, cached: &TranslationEntry) {
        match self.mode {
            TranslationMode::PerProcess => {
                let Some(space) = kernel.machine.active_space() else {
                    return;
                };
                if space.tid != cached.tid {
                    return;
                }
                let mut table = space.table.lock();
                if cached.vpn < table.len() {
                    let pte = &mut table[cached.vpn];
                    if pte.is_valid() && pte.ppn == cached.ppn {
                        pte.flags |= cached.flags & (PteFlags::USE | PteFlags::DIRTY);
                        pte.lru_record = pte.lru_record.max(cached.lru_record);
                    }
                }
            }
            TranslationMode::Inverted => {
                let mut inner = self.inner.lock();
                let pte = &mut inner.ipt[cached.ppn];
                if pte.is_valid() && pte.vpn == cached.vpn && pte.tid == cached.tid {
                    pte.flags |= cached.flags & (PteFlags::USE | PteFlags::DIRTY);
                    pte.lru_record = pte.lru_record.max(cached.lru_record);
                }
            }
        }
    }
}
