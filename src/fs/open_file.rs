//! Open files: positioned and random-access reads and writes against an
//! inode, with read-modify-write of partial sectors and growth on writes
//! past end of file.

use parking_lot::Mutex;

use crate::fs::file_header::FileHeader;
use crate::types::{Sector, SECTOR_SIZE};
use crate::Kernel;

/// A handle bound to the file whose header lives at `hdr_sector`.
///
/// The header itself is re-fetched per operation under the per-sector
/// header lock, so concurrent handles to the same file serialize their
/// header updates there (data-sector interleavings still serialize only
/// at the disk mutex).
#[derive(Debug)]
pub struct OpenFile {
    hdr_sector: Sector,
    seek: Mutex<usize>,
}

impl OpenFile {
    pub fn new(hdr_sector: Sector) -> Self {
        Self {
            hdr_sector,
            seek: Mutex::new(0),
        }
    }

    pub fn hdr_sector(&self) -> Sector {
        self.hdr_sector
    }

    /// Current length in bytes.
    pub fn length(&self, kernel: &Kernel) -> usize {
        FileHeader::fetch_from(kernel, self.hdr_sector).file_length()
    }

    /// Move the sequential position.
    pub fn seek(&self, position: usize) {
        *self.seek.lock() = position;
    }

    /// Read from the sequential position, advancing it.
    pub fn read(&self, kernel: &Kernel, buf: &mut [u8]) -> usize {
        let position = *self.seek.lock();
        let got = self.read_at(kernel, buf, position);
        *self.seek.lock() = position + got;
        got
    }

    /// Write at the sequential position, advancing it.
    pub fn write(&self, kernel: &Kernel, buf: &[u8]) -> usize {
        let position = *self.seek.lock();
        let put = self.write_at(kernel, buf, position);
        *self.seek.lock() = position + put;
        put
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Reading at or
    /// past end of file returns 0 bytes.
    pub fn read_at(&self, kernel: &Kernel, buf: &mut [u8], offset: usize) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let header_lock = kernel.synch_disk.header_lock(self.hdr_sector);
        header_lock.acquire(kernel);

        let mut hdr = FileHeader::fetch_from(kernel, self.hdr_sector);
        let len = hdr.file_length();
        if offset >= len {
            header_lock.release(kernel);
            return 0;
        }
        let count = buf.len().min(len - offset);

        let first = offset / SECTOR_SIZE;
        let last = (offset + count - 1) / SECTOR_SIZE;
        let mut copied = 0;
        for s in first..=last {
            let sector = hdr.byte_to_sector(kernel, s * SECTOR_SIZE);
            let mut raw = [0u8; SECTOR_SIZE];
            kernel.synch_disk.read_sector(kernel, sector, &mut raw);
            let begin = if s == first { offset % SECTOR_SIZE } else { 0 };
            let take = (SECTOR_SIZE - begin).min(count - copied);
            buf[copied..copied + take].copy_from_slice(&raw[begin..begin + take]);
            copied += take;
        }

        if hdr.file_type().keeps_timestamps() {
            hdr.set_access_time(kernel);
            hdr.write_back(kernel, self.hdr_sector);
        }
        header_lock.release(kernel);
        count
    }

    /// Write `buf` starting at `offset`, extending the file when the
    /// write runs past end of file (clamped to what still fits when the
    /// disk cannot grow it).
    pub fn write_at(&self, kernel: &Kernel, buf: &[u8], offset: usize) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let header_lock = kernel.synch_disk.header_lock(self.hdr_sector);
        header_lock.acquire(kernel);

        let mut hdr = FileHeader::fetch_from(kernel, self.hdr_sector);
        let mut len = hdr.file_length();
        let wanted_end = offset + buf.len();
        let mut hdr_dirty = false;
        if wanted_end > len {
            match kernel.file_system.expand_file(kernel, &mut hdr, wanted_end) {
                Ok(()) => {
                    len = wanted_end;
                    hdr_dirty = true;
                }
                Err(err) => {
                    log::debug!(target: "minnow::fs", "write could not grow file: {err}");
                }
            }
        }
        if offset >= len {
            if hdr_dirty {
                hdr.write_back(kernel, self.hdr_sector);
            }
            header_lock.release(kernel);
            return 0;
        }
        let count = buf.len().min(len - offset);

        let first = offset / SECTOR_SIZE;
        let last = (offset + count - 1) / SECTOR_SIZE;
        let mut copied = 0;
        for s in first..=last {
            let sector = hdr.byte_to_sector(kernel, s * SECTOR_SIZE);
            let begin = if s == first { offset % SECTOR_SIZE } else { 0 };
            let take = (SECTOR_SIZE - begin).min(count - copied);
            let mut raw = [0u8; SECTOR_SIZE];
            if begin != 0 || take != SECTOR_SIZE {
                kernel.synch_disk.read_sector(kernel, sector, &mut raw);
            }
            raw[begin..begin + take].copy_from_slice(&buf[copied..copied + take]);
            kernel.synch_disk.write_sector(kernel, sector, &raw);
            copied += take;
        }

        if hdr.file_type().keeps_timestamps() {
            hdr.set_modify_time(kernel);
            hdr_dirty = true;
        }
        if hdr_dirty {
            hdr.write_back(kernel, self.hdr_sector);
        }
        header_lock.release(kernel);
        count
    }
}
