//! Demand paging.
//!
//! Every address space is backed by a swap file `vm_<tid>` whose raw
//! bytes are the process image: the page at `vpn` lives at byte offset
//! `vpn * PAGE_SIZE`. A fault either refills the TLB from a still-valid
//! table entry, or claims a frame (free, else the LRU victim), writes the
//! victim through to its owner's swap file when dirty, and reads the
//! requested page in.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::kern::thread;
use crate::types::{Tid, PAGE_SIZE};
use crate::vm::addr_space::AddressSpace;
use crate::vm::page_table::{PteFlags, TranslationEntry, TranslationMode};
use crate::vm::tlb;
use crate::Kernel;

/// Outcome of a page-fault resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The translation is installed; retry the access.
    Resolved,
    /// Local replacement found no evictable page; the faulting thread
    /// should yield and retry.
    Unresolvable,
}

/// Resolve a fault at `vaddr` for the current thread.
pub fn page_fault(kernel: &Kernel, vaddr: usize) -> FaultResolution {
    kernel.vm.stats.page_faults.fetch_add(1, Ordering::SeqCst);
    let vpn = vaddr / PAGE_SIZE;
    let space = thread::current_space(kernel).expect("page fault without an address space");
    match kernel.vm.mode() {
        TranslationMode::PerProcess => per_process_fault(kernel, &space, vpn),
        TranslationMode::Inverted => inverted_fault(kernel, &space, vpn),
    }
}

fn per_process_fault(kernel: &Kernel, space: &Arc<AddressSpace>, vpn: usize) -> FaultResolution {
    {
        let table = space.table.lock();
        let pte = table[vpn];
        if pte.is_valid() {
            // TLB miss only; the page is already resident.
            drop(table);
            tlb::refill(kernel, pte);
            return FaultResolution::Resolved;
        }
    }

    let frame = match kernel.vm.allocate_frame() {
        Some(frame) => frame,
        None => {
            // Local replacement: the least recently stamped valid page in
            // this process's own table.
            let victim_vpn = {
                let table = space.table.lock();
                table
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.is_valid())
                    .min_by_key(|(_, e)| e.lru_record)
                    .map(|(v, _)| v)
            };
            let Some(victim_vpn) = victim_vpn else {
                log::debug!(target: "minnow::pager", "fault vpn={vpn}: no local victim");
                return FaultResolution::Unresolvable;
            };
            let mut victim = {
                let mut table = space.table.lock();
                let v = table[victim_vpn];
                table[victim_vpn] = TranslationEntry::invalid();
                v
            };
            if let Some(cached) = kernel.machine.tlb_take_vpn(victim_vpn) {
                victim.flags |= cached.flags & (PteFlags::USE | PteFlags::DIRTY);
            }
            if victim.flags.contains(PteFlags::DIRTY) {
                write_page_to_swap(kernel, space.tid, victim.vpn, victim.ppn);
            }
            victim.ppn
        }
    };

    read_page_from_swap(kernel, space.tid, vpn, frame);
    let entry = TranslationEntry {
        vpn,
        ppn: frame,
        flags: PteFlags::VALID,
        lru_record: 0,
        tid: space.tid,
    };
    space.table.lock()[vpn] = entry;
    tlb::refill(kernel, entry);
    FaultResolution::Resolved
}

fn inverted_fault(kernel: &Kernel, space: &Arc<AddressSpace>, vpn: usize) -> FaultResolution {
    let tid = space.tid;
    if let Some(frame) = kernel.vm.ipt_find(tid, vpn) {
        tlb::refill(kernel, kernel.vm.ipt_entry(frame));
        return FaultResolution::Resolved;
    }

    let frame = match kernel.vm.allocate_frame() {
        Some(frame) => frame,
        None => {
            // Global replacement over the whole inverted table.
            let frame = kernel
                .vm
                .ipt_lru_victim()
                .expect("no free frame implies a valid victim");
            let mut victim = kernel.vm.ipt_entry(frame);
            kernel.vm.ipt_set(frame, TranslationEntry::invalid());
            if let Some(cached) = kernel.machine.tlb_take_ppn(frame) {
                victim.flags |= cached.flags & (PteFlags::USE | PteFlags::DIRTY);
            }
            if victim.flags.contains(PteFlags::DIRTY) {
                write_page_to_swap(kernel, victim.tid, victim.vpn, victim.ppn);
            }
            frame
        }
    };

    read_page_from_swap(kernel, tid, vpn, frame);
    let entry = TranslationEntry {
        vpn,
        ppn: frame,
        flags: PteFlags::VALID,
        lru_record: 0,
        tid,
    };
    kernel.vm.ipt_set(frame, entry);
    tlb::refill(kernel, entry);
    FaultResolution::Resolved
}

/// The swap file backing thread `tid`.
pub fn swap_path(tid: Tid) -> String {
    format!("/vm_{tid}")
}

fn write_page_to_swap(kernel: &Kernel, owner: Tid, vpn: usize, ppn: usize) {
    let page = kernel.machine.read_frame(ppn);
    let swap = kernel
        .file_system
        .open(kernel, &swap_path(owner))
        .expect("swap file of a mapped page");
    swap.write_at(kernel, &page, vpn * PAGE_SIZE);
    kernel.vm.stats.swap_writes.fetch_add(1, Ordering::SeqCst);
    log::trace!(target: "minnow::pager", "wrote dirty vpn={vpn} of tid={owner} to swap");
}

fn read_page_from_swap(kernel: &Kernel, owner: Tid, vpn: usize, ppn: usize) {
    let swap = kernel
        .file_system
        .open(kernel, &swap_path(owner))
        .expect("swap file of the faulting space");
    let mut page = [0u8; PAGE_SIZE];
    let got = swap.read_at(kernel, &mut page, vpn * PAGE_SIZE);
    debug_assert_eq!(got, PAGE_SIZE);
    kernel.machine.write_frame(ppn, &page);
    kernel.vm.stats.swap_reads.fetch_add(1, Ordering::SeqCst);
    log::trace!(target: "minnow::pager", "loaded vpn={vpn} of tid={owner} into frame {ppn}");
}
