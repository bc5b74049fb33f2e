//! TLB refill policies.
//!
//! The TLB itself lives in the machine shim; the kernel decides which
//! slot a new translation displaces. Whatever is evicted gets its
//! reference, dirty and recency state written back to the page table (or
//! inverted table) it was filled from.

use crate::types::TLB_SIZE;
use crate::vm::page_table::TranslationEntry;
use crate::Kernel;

/// Selectable TLB replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbPolicy {
    /// Slot is `vpn % TLB_SIZE`.
    Modulo,
    /// Oldest entry leaves; new entries enter at the tail.
    Fifo,
    /// Prefer an invalid slot, otherwise the smallest recency stamp.
    Lru,
}

/// Install `entry` in the TLB according to the kernel's active policy.
pub(crate) fn refill(kernel: &Kernel, entry: TranslationEntry) {
    let policy = kernel.options.tlb_policy;
    kernel.machine.with_tlb(|tlb| match policy {
        TlbPolicy::Modulo => {
            let idx = entry.vpn % TLB_SIZE;
            evict(kernel, &tlb[idx]);
            tlb[idx] = entry;
        }
        TlbPolicy::Fifo => {
            let idx = tlb.iter().position(|e| !e.is_valid()).unwrap_or(0);
            evict(kernel, &tlb[idx]);
            for j in idx..TLB_SIZE - 1 {
                tlb[j] = tlb[j + 1];
            }
            tlb[TLB_SIZE - 1] = entry;
        }
        TlbPolicy::Lru => {
            let idx = match tlb.iter().position(|e| !e.is_valid()) {
                Some(free) => free,
                None => {
                    let (oldest, _) = tlb
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.lru_record)
                        .expect("TLB is never empty");
                    oldest
                }
            };
            evict(kernel, &tlb[idx]);
            tlb[idx] = entry;
        }
    });
}

fn evict(kernel: &Kernel, old: &TranslationEntry) {
    if old.is_valid() {
        kernel.vm.propagate(kernel, old);
    }
}
