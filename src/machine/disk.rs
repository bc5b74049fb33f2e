//! The simulated physical disk.
//!
//! An asynchronous device: `read_request`/`write_request` latch a single
//! outstanding operation and return immediately; the completion interrupt
//! arrives [`DISK_LATENCY_TICKS`] later through the gate. Only the
//! synchronous layer ([`crate::fs::SynchDisk`]) talks to this device, and
//! it guarantees one request at a time.

use parking_lot::Mutex;

use crate::machine::interrupt::IntKind;
use crate::types::{Sector, DISK_LATENCY_TICKS, NUM_SECTORS, SECTOR_SIZE};
use crate::Kernel;

#[derive(Debug)]
struct DiskState {
    sectors: Vec<u8>,
    busy: bool,
}

/// The raw sector store plus the one-outstanding-request latch.
#[derive(Debug)]
pub struct Disk {
    state: Mutex<DiskState>,
}

impl Disk {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DiskState {
                sectors: vec![0; NUM_SECTORS * SECTOR_SIZE],
                busy: false,
            }),
        }
    }

    /// Post a read of `sector` into `buf` and schedule the completion
    /// interrupt. The data is latched immediately; it becomes valid to the
    /// caller when the interrupt arrives.
    pub fn read_request(&self, kernel: &Kernel, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) {
        let off = Self::offset(sector);
        {
            let mut st = self.state.lock();
            assert!(!st.busy, "disk request posted while device busy");
            st.busy = true;
            buf.copy_from_slice(&st.sectors[off..off + SECTOR_SIZE]);
        }
        log::trace!(target: "minnow::disk", "read request, sector {sector}");
        kernel.interrupt.schedule(DISK_LATENCY_TICKS, IntKind::DiskDone);
    }

    /// Post a write of `buf` to `sector` and schedule the completion
    /// interrupt.
    pub fn write_request(&self, kernel: &Kernel, sector: Sector, buf: &[u8; SECTOR_SIZE]) {
        let off = Self::offset(sector);
        {
            let mut st = self.state.lock();
            assert!(!st.busy, "disk request posted while device busy");
            st.busy = true;
            st.sectors[off..off + SECTOR_SIZE].copy_from_slice(buf);
        }
        log::trace!(target: "minnow::disk", "write request, sector {sector}");
        kernel.interrupt.schedule(DISK_LATENCY_TICKS, IntKind::DiskDone);
    }

    /// Called by the synchronous layer when the completion interrupt has
    /// been delivered.
    pub(crate) fn complete(&self) {
        let mut st = self.state.lock();
        assert!(st.busy);
        st.busy = false;
    }

    /// Full raw disk image, for snapshot comparisons in tests.
    pub fn image(&self) -> Vec<u8> {
        self.state.lock().sectors.clone()
    }

    fn offset(sector: Sector) -> usize {
        let sector = sector as usize;
        assert!(sector < NUM_SECTORS, "sector {sector} out of range");
        sector * SECTOR_SIZE
    }
}
