//! The simulated machine the kernel runs on: register file, physical
//! memory, and the hardware translation lookaside buffer.
//!
//! The instruction interpreter itself is outside the kernel core; the
//! kernel consumes this shim through registers, `read_mem`/`write_mem`
//! (which translate through the TLB and raise exceptions on a miss), and
//! the PC-advance convention used after a handled syscall.

pub mod disk;
pub mod interrupt;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::types::{NEXT_PC_REG, NUM_TOTAL_REGS, PAGE_SIZE, PC_REG, PREV_PC_REG, TLB_SIZE};
use crate::vm::addr_space::AddressSpace;
use crate::vm::page_table::{PteFlags, TranslationEntry};
use crate::Kernel;

/// Exceptions the memory system can raise on a user access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MachineException {
    #[error("page fault at virtual address {vaddr:#x}")]
    PageFault { vaddr: usize },
    #[error("address error at virtual address {vaddr:#x}")]
    AddressError { vaddr: usize },
}

/// Register file, RAM and TLB of the simulated machine.
#[derive(Debug)]
pub struct Machine {
    regs: Mutex<[i32; NUM_TOTAL_REGS]>,
    ram: Mutex<Vec<u8>>,
    tlb: Mutex<[TranslationEntry; TLB_SIZE]>,
    active: Mutex<Option<Arc<AddressSpace>>>,
    lru_clock: AtomicU64,
    num_phys_pages: usize,
}

impl Machine {
    pub(crate) fn new(num_phys_pages: usize) -> Self {
        Self {
            regs: Mutex::new([0; NUM_TOTAL_REGS]),
            ram: Mutex::new(vec![0; num_phys_pages * PAGE_SIZE]),
            tlb: Mutex::new([TranslationEntry::invalid(); TLB_SIZE]),
            active: Mutex::new(None),
            lru_clock: AtomicU64::new(1),
            num_phys_pages,
        }
    }

    /// Number of physical page frames.
    pub fn num_phys_pages(&self) -> usize {
        self.num_phys_pages
    }

    // ========================================================================
    // Registers
    // ========================================================================

    pub fn read_register(&self, reg: usize) -> i32 {
        self.regs.lock()[reg]
    }

    pub fn write_register(&self, reg: usize, value: i32) {
        self.regs.lock()[reg] = value;
    }

    /// Advance the PC past a handled syscall instruction.
    pub fn advance_pc(&self) {
        let mut regs = self.regs.lock();
        regs[PREV_PC_REG] = regs[PC_REG];
        regs[PC_REG] = regs[NEXT_PC_REG];
        regs[NEXT_PC_REG] += 4;
    }

    pub(crate) fn snapshot_regs(&self) -> [i32; NUM_TOTAL_REGS] {
        *self.regs.lock()
    }

    pub(crate) fn load_regs(&self, saved: &[i32; NUM_TOTAL_REGS]) {
        *self.regs.lock() = *saved;
    }

    // ========================================================================
    // User memory access
    // ========================================================================

    /// Read `size` bytes (1, 2 or 4, naturally aligned) at `vaddr`,
    /// assembled little-endian.
    pub fn read_mem(
        &self,
        kernel: &Kernel,
        vaddr: usize,
        size: usize,
    ) -> Result<i32, MachineException> {
        let paddr = self.translate(kernel, vaddr, size, false)?;
        let ram = self.ram.lock();
        let mut value = 0i32;
        for i in (0..size).rev() {
            value = (value << 8) | ram[paddr + i] as i32;
        }
        Ok(value)
    }

    /// Write the low `size` bytes of `value` at `vaddr`, little-endian.
    pub fn write_mem(
        &self,
        kernel: &Kernel,
        vaddr: usize,
        size: usize,
        value: i32,
    ) -> Result<(), MachineException> {
        let paddr = self.translate(kernel, vaddr, size, true)?;
        let mut ram = self.ram.lock();
        for i in 0..size {
            ram[paddr + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    /// Translate through the TLB. A miss is a page fault even when the
    /// underlying page table entry is valid; the kernel resolves it and
    /// the access retries.
    fn translate(
        &self,
        kernel: &Kernel,
        vaddr: usize,
        size: usize,
        writing: bool,
    ) -> Result<usize, MachineException> {
        debug_assert!(size == 1 || size == 2 || size == 4);
        if vaddr % size != 0 {
            return Err(MachineException::AddressError { vaddr });
        }
        let space = self.active.lock().clone();
        let Some(space) = space else {
            return Err(MachineException::AddressError { vaddr });
        };
        if vaddr + size > space.num_pages * PAGE_SIZE {
            return Err(MachineException::AddressError { vaddr });
        }
        let _ = kernel;

        let vpn = vaddr / PAGE_SIZE;
        let mut tlb = self.tlb.lock();
        for entry in tlb.iter_mut() {
            if entry.flags.contains(PteFlags::VALID) && entry.vpn == vpn {
                if writing && entry.flags.contains(PteFlags::READ_ONLY) {
                    return Err(MachineException::AddressError { vaddr });
                }
                entry.flags.insert(PteFlags::USE);
                if writing {
                    entry.flags.insert(PteFlags::DIRTY);
                }
                entry.lru_record = self.lru_clock.fetch_add(1, Ordering::SeqCst);
                return Ok(entry.ppn * PAGE_SIZE + vaddr % PAGE_SIZE);
            }
        }
        Err(MachineException::PageFault { vaddr })
    }

    // ========================================================================
    // Address-space switching
    // ========================================================================

    /// Install `space` as the MMU view. The TLB is written back to the
    /// kernel's tables and invalidated first, so reference and dirty bits
    /// survive the switch.
    pub(crate) fn set_active_space(&self, kernel: &Kernel, space: Option<Arc<AddressSpace>>) {
        self.tlb_sync_and_flush(kernel);
        *self.active.lock() = space;
    }

    pub(crate) fn active_space(&self) -> Option<Arc<AddressSpace>> {
        self.active.lock().clone()
    }

    /// Propagate every valid TLB entry back to its page-table/IPT entry,
    /// then invalidate the whole TLB.
    pub(crate) fn tlb_sync_and_flush(&self, kernel: &Kernel) {
        let mut tlb = self.tlb.lock();
        for entry in tlb.iter_mut() {
            if entry.flags.contains(PteFlags::VALID) {
                kernel.vm.propagate(kernel, entry);
            }
            *entry = TranslationEntry::invalid();
        }
    }

    /// Remove the entry mapping `vpn`, returning the copy that was cached
    /// there. Used by the pager when evicting a victim page.
    pub(crate) fn tlb_take_vpn(&self, vpn: usize) -> Option<TranslationEntry> {
        let mut tlb = self.tlb.lock();
        for entry in tlb.iter_mut() {
            if entry.flags.contains(PteFlags::VALID) && entry.vpn == vpn {
                let taken = *entry;
                *entry = TranslationEntry::invalid();
                return Some(taken);
            }
        }
        None
    }

    /// Remove the entry mapping physical frame `ppn`, returning the copy.
    pub(crate) fn tlb_take_ppn(&self, ppn: usize) -> Option<TranslationEntry> {
        let mut tlb = self.tlb.lock();
        for entry in tlb.iter_mut() {
            if entry.flags.contains(PteFlags::VALID) && entry.ppn == ppn {
                let taken = *entry;
                *entry = TranslationEntry::invalid();
                return Some(taken);
            }
        }
        None
    }

    /// Run `f` with the raw TLB array; used by the replacement policies.
    pub(crate) fn with_tlb<R>(&self, f: impl FnOnce(&mut [TranslationEntry; TLB_SIZE]) -> R) -> R {
        f(&mut self.tlb.lock())
    }

    // ========================================================================
    // Physical frame access (for the pager and address-space loader)
    // ========================================================================

    pub(crate) fn read_frame(&self, ppn: usize) -> [u8; PAGE_SIZE] {
        let ram = self.ram.lock();
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(&ram[ppn * PAGE_SIZE..(ppn + 1) * PAGE_SIZE]);
        page
    }

    pub(crate) fn write_frame(&self, ppn: usize, page: &[u8; PAGE_SIZE]) {
        let mut ram = self.ram.lock();
        ram[ppn * PAGE_SIZE..(ppn + 1) * PAGE_SIZE].copy_from_slice(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelOptions;

    #[test]
    fn registers_and_pc_advance() {
        let kernel = Kernel::new(KernelOptions::bare());
        kernel.machine.write_register(PC_REG, 0);
        kernel.machine.write_register(NEXT_PC_REG, 4);
        kernel.machine.advance_pc();
        assert_eq!(kernel.machine.read_register(PREV_PC_REG), 0);
        assert_eq!(kernel.machine.read_register(PC_REG), 4);
        assert_eq!(kernel.machine.read_register(NEXT_PC_REG), 8);
    }

    #[test]
    fn access_without_space_is_an_address_error() {
        let kernel = Kernel::new(KernelOptions::bare());
        assert_eq!(
            kernel.machine.read_mem(&kernel, 0, 4),
            Err(MachineException::AddressError { vaddr: 0 })
        );
    }

    #[test]
    fn misaligned_access_is_an_address_error() {
        let kernel = Kernel::new(KernelOptions::bare());
        assert_eq!(
            kernel.machine.read_mem(&kernel, 1, 4),
            Err(MachineException::AddressError { vaddr: 1 })
        );
    }
}
