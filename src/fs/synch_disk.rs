//! Synchronous access to the asynchronous disk.
//!
//! The physical device accepts one request and interrupts later; this
//! layer makes in-kernel callers block until that interrupt arrives,
//! using a "done" semaphore posted by the completion handler and a mutex
//! so only one request is ever outstanding. Every sector of file-system
//! traffic serializes through that one mutex, which is deliberately
//! coarse.
//!
//! Per-sector header locks are also kept here, giving open files a finer
//! lock around header read/modify/write cycles.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::kern::sync::{Lock, Semaphore};
use crate::types::{Sector, SECTOR_SIZE};
use crate::Kernel;

/// The synchronous disk interface.
#[derive(Debug)]
pub struct SynchDisk {
    done: Semaphore,
    lock: Lock,
    header_locks: Mutex<BTreeMap<Sector, Arc<Lock>>>,
}

impl SynchDisk {
    pub(crate) fn new() -> Self {
        Self {
            done: Semaphore::new("synch disk", 0),
            lock: Lock::new("synch disk lock"),
            header_locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Read `sector` into `buf`, returning only after the data is valid.
    pub fn read_sector(&self, kernel: &Kernel, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) {
        self.lock.acquire(kernel);
        kernel.disk.read_request(kernel, sector, buf);
        self.done.p(kernel);
        self.lock.release(kernel);
    }

    /// Write `buf` to `sector`, returning only after the write is done.
    pub fn write_sector(&self, kernel: &Kernel, sector: Sector, buf: &[u8; SECTOR_SIZE]) {
        self.lock.acquire(kernel);
        kernel.disk.write_request(kernel, sector, buf);
        self.done.p(kernel);
        self.lock.release(kernel);
    }

    /// Completion interrupt handler: wake the thread waiting on the
    /// outstanding request.
    pub(crate) fn request_done(&self, kernel: &Kernel) {
        kernel.disk.complete();
        self.done.v(kernel);
    }

    /// The lock guarding the file header stored at `sector`, created on
    /// first use.
    pub(crate) fn header_lock(&self, sector: Sector) -> Arc<Lock> {
        let mut locks = self.header_locks.lock();
        locks
            .entry(sector)
            .or_insert_with(|| Arc::new(Lock::new("file header lock")))
            .clone()
    }
}
