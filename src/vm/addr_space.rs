//! Address spaces.
//!
//! An address space is built from an executable image: it owns a
//! page-table array sized to the image's page count, a swap file
//! `vm_<tid>` holding the raw image, and the executable name (reused when
//! the process forks). As many pages as there are free frames are loaded
//! eagerly; the rest arrive by demand paging.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::fs::FsError;
use crate::kern::thread;
use crate::types::{
    Tid, NEXT_PC_REG, NUM_TOTAL_REGS, PAGE_SIZE, PC_REG, STACK_REG,
};
use crate::utilities::div_round_up;
use crate::vm::page_table::{PteFlags, TranslationEntry, TranslationMode};
use crate::vm::pager;
use crate::Kernel;

/// One process's memory image. Exclusively owned by one thread and torn
/// down when that thread exits.
#[derive(Debug)]
pub struct AddressSpace {
    pub tid: Tid,
    pub num_pages: usize,
    pub exec_name: String,
    pub swap_path: String,
    /// Per-process translation table. Unused (left empty of valid
    /// entries) in the inverted configuration, where mappings live in the
    /// kernel-wide table instead.
    pub(crate) table: Mutex<Vec<TranslationEntry>>,
}

impl AddressSpace {
    /// Build an address space for the current thread from `image`,
    /// creating and filling its swap file.
    pub fn new(kernel: &Kernel, exec_name: &str, image: &[u8]) -> Result<Arc<Self>, FsError> {
        let tid = thread::current(kernel);
        let num_pages = div_round_up(image.len().max(1), PAGE_SIZE);
        let swap_path = pager::swap_path(tid);

        // A recycled tid may have left a stale swap file behind.
        let _ = kernel.file_system.remove(kernel, &swap_path);
        kernel
            .file_system
            .create(kernel, &swap_path, Some((num_pages * PAGE_SIZE) as u32))?;

        let mut padded = image.to_vec();
        padded.resize(num_pages * PAGE_SIZE, 0);
        let swap = kernel.file_system.open(kernel, &swap_path)?;
        swap.write_at(kernel, &padded, 0);

        let space = Arc::new(Self {
            tid,
            num_pages,
            exec_name: exec_name.to_owned(),
            swap_path,
            table: Mutex::new(vec![TranslationEntry::invalid(); num_pages]),
        });

        // Eager load: claim frames while they last.
        let mut resident = 0;
        for vpn in 0..num_pages {
            let Some(frame) = kernel.vm.allocate_frame() else {
                break;
            };
            let mut page = [0u8; PAGE_SIZE];
            page.copy_from_slice(&padded[vpn * PAGE_SIZE..(vpn + 1) * PAGE_SIZE]);
            kernel.machine.write_frame(frame, &page);
            let entry = TranslationEntry {
                vpn,
                ppn: frame,
                flags: PteFlags::VALID,
                lru_record: 0,
                tid,
            };
            match kernel.vm.mode() {
                TranslationMode::PerProcess => space.table.lock()[vpn] = entry,
                TranslationMode::Inverted => kernel.vm.ipt_set(frame, entry),
            }
            resident += 1;
        }
        log::debug!(
            target: "minnow::addrspace",
            "built space for tid={tid}: {num_pages} pages, {resident} resident, exec={exec_name}"
        );
        Ok(space)
    }

    /// Clear the architectural registers and point PC and SP at the image.
    pub fn init_registers(&self, kernel: &Kernel) {
        for reg in 0..NUM_TOTAL_REGS {
            kernel.machine.write_register(reg, 0);
        }
        kernel.machine.write_register(PC_REG, 0);
        kernel.machine.write_register(NEXT_PC_REG, 4);
        let sp = self.num_pages * PAGE_SIZE - 16;
        kernel.machine.write_register(STACK_REG, sp as i32);
    }

    /// Write the MMU's cached reference/dirty state back to the tables.
    /// Called on a switch away from this space.
    pub fn save_state(&self, kernel: &Kernel) {
        kernel.machine.tlb_sync_and_flush(kernel);
    }

    /// Install this space as the machine's MMU view.
    pub fn restore_state(self: &Arc<Self>, kernel: &Kernel) {
        kernel.machine.set_active_space(kernel, Some(self.clone()));
    }

    /// Release every frame this space holds and delete its swap file.
    pub fn destroy(&self, kernel: &Kernel) {
        match kernel.vm.mode() {
            TranslationMode::PerProcess => {
                let mut table = self.table.lock();
                for entry in table.iter_mut() {
                    if entry.is_valid() {
                        kernel.machine.tlb_take_vpn(entry.vpn);
                        kernel.vm.release_frame(entry.ppn);
                        *entry = TranslationEntry::invalid();
                    }
                }
            }
            TranslationMode::Inverted => {
                for ppn in kernel.vm.ipt_evict_tid(self.tid) {
                    kernel.machine.tlb_take_ppn(ppn);
                    kernel.vm.release_frame(ppn);
                }
            }
        }
        let _ = kernel.file_system.remove(kernel, &self.swap_path);
        log::debug!(target: "minnow::addrspace", "destroyed space of tid={}", self.tid);
    }
}
