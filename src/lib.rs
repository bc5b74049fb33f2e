//! Minnow - a teaching kernel core on a simulated MIPS-like machine.
//!
//! The kernel multiplexes one simulated CPU among cooperative threads,
//! provides the classic synchronization primitives, manages a TLB-based
//! virtual-memory layer with demand paging, and implements a small
//! on-disk file system with hierarchical directories. The machine
//! itself (instruction interpreter, disk device, register file) is
//! simulated in-process, so the whole system runs and is tested as an
//! ordinary user-space crate.
//!
//! Instead of process-wide globals for `current thread`, `scheduler`,
//! `machine` and friends, everything hangs off one [`Kernel`] aggregate
//! with a fixed construction order; subsystem calls take a `&Kernel`
//! handle. Each test builds its own isolated kernel.

pub mod fs;
pub mod kern;
pub mod machine;
pub mod types;
pub mod user;
pub mod utilities;
pub mod vm;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs::{FileSystem, SynchDisk};
use kern::scheduler::{self, Scheduler};
use machine::disk::Disk;
use machine::interrupt::{IntKind, Interrupt};
use machine::Machine;
use types::{DEFAULT_NUM_PHYS_PAGES, TIMER_TICKS};
use user::syscall::FdTable;
use vm::page_table::TranslationMode;
use vm::tlb::TlbPolicy;
use vm::VmState;

/// Build-time knobs of a kernel instance.
#[derive(Debug, Clone, Copy)]
pub struct KernelOptions {
    /// Lay down a fresh file system on the (zeroed) disk.
    pub format_disk: bool,
    /// Arm the periodic preemption timer.
    pub preemptive_timer: bool,
    /// Age ready threads every this many ticks; 0 disables aging.
    pub aging_ticks: u64,
    /// Per-process page tables or one inverted table.
    pub translation: TranslationMode,
    /// TLB replacement policy.
    pub tlb_policy: TlbPolicy,
    /// Physical frames in the simulated machine.
    pub num_phys_pages: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            format_disk: true,
            preemptive_timer: false,
            aging_ticks: 1024,
            translation: TranslationMode::PerProcess,
            tlb_policy: TlbPolicy::Lru,
            num_phys_pages: DEFAULT_NUM_PHYS_PAGES,
        }
    }
}

impl KernelOptions {
    /// A kernel without a formatted disk, for tests that never touch the
    /// file system.
    pub fn bare() -> Self {
        Self {
            format_disk: false,
            ..Self::default()
        }
    }
}

/// The process-wide kernel aggregate.
///
/// Construction order matters: the gate and machine first, then the
/// disk pair, then the scheduler (which adopts the calling host thread
/// as the main kernel thread), and the file system format last because
/// formatting already does synchronous disk I/O through the scheduler.
pub struct Kernel {
    pub options: KernelOptions,
    pub interrupt: Interrupt,
    pub machine: Machine,
    pub disk: Disk,
    pub synch_disk: SynchDisk,
    pub scheduler: Scheduler,
    pub file_system: FileSystem,
    pub vm: VmState,
    pub files: FdTable,
    panicked: AtomicBool,
}

impl Kernel {
    pub fn new(options: KernelOptions) -> Arc<Self> {
        let kernel = Arc::new(Self {
            options,
            interrupt: Interrupt::new(),
            machine: Machine::new(options.num_phys_pages),
            disk: Disk::new(),
            synch_disk: SynchDisk::new(),
            scheduler: Scheduler::new(options.aging_ticks),
            file_system: FileSystem::new(),
            vm: VmState::new(options.translation, options.num_phys_pages),
            files: FdTable::new(),
            panicked: AtomicBool::new(false),
        });
        scheduler::bootstrap_main(&kernel);
        if options.format_disk {
            kernel.file_system.format(&kernel);
        }
        if options.preemptive_timer {
            kernel.interrupt.schedule(TIMER_TICKS, IntKind::Timer);
        }
        log::debug!(target: "minnow::kernel", "kernel up, {options:?}");
        kernel
    }

    /// A kernel thread panicked; joiners re-raise this.
    pub(crate) fn note_panic(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    pub fn has_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }
}
