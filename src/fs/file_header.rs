//! File headers (inodes).
//!
//! A header fits in exactly one sector and holds the file length, type,
//! three fixed-width timestamps, a back-reference to the Path File that
//! records the absolute path the file was created under, and the block
//! map: [`NUM_DIRECT`] direct sector numbers plus one sector that heads a
//! two-level indirect tree (a table of up to [`NUM_INDIRECT`] index
//! sectors, each listing up to [`NUM_INDIRECT`] data sectors).
//!
//! On-disk layout of the 128-byte header:
//!
//! | offset | field |
//! |---|---|
//! | 0  | num_bytes (u32) |
//! | 4  | num_sectors (u32) |
//! | 8  | file type (u32) |
//! | 12 | create time (25 bytes) |
//! | 37 | last access time (25 bytes) |
//! | 62 | last modify time (25 bytes) |
//! | 88 | path-file sector (u32) |
//! | 92 | path length (u32) |
//! | 96 | data sectors (8 x u32) |

use crate::fs::open_file::OpenFile;
use crate::fs::FsError;
use crate::fs::bitmap::FreeMap;
use crate::types::{Sector, SECTOR_SIZE};
use crate::utilities::{div_round_up, get_u32, put_u32};
use crate::Kernel;

/// Direct block-map slots in a header.
pub const NUM_DIRECT: usize = 7;
/// Sector numbers per index sector.
pub const NUM_INDIRECT: usize = SECTOR_SIZE / 4;
/// Characters in a timestamp, excluding the terminator.
pub const TIME_LENGTH: usize = 24;
/// Largest file the block map can address.
pub const MAX_FILE_SIZE: usize = (NUM_DIRECT + NUM_INDIRECT * NUM_INDIRECT) * SECTOR_SIZE;

const OFF_NUM_BYTES: usize = 0;
const OFF_NUM_SECTORS: usize = 4;
const OFF_TYPE: usize = 8;
const OFF_CREATE: usize = 12;
const OFF_ACCESS: usize = 37;
const OFF_MODIFY: usize = 62;
const OFF_PATH_SECTOR: usize = 88;
const OFF_PATH_LEN: usize = 92;
const OFF_DATA: usize = 96;

/// What a file holds; Name and Path files are file-system plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Normal = 0,
    Directory = 1,
    BitMap = 2,
    Name = 3,
    Path = 4,
}

impl FileType {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Normal,
            1 => Self::Directory,
            2 => Self::BitMap,
            3 => Self::Name,
            4 => Self::Path,
            other => panic!("corrupt file header: type {other}"),
        }
    }

    /// Timestamps are only maintained for user-visible files.
    pub fn keeps_timestamps(self) -> bool {
        matches!(self, Self::Normal | Self::Directory)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Normal => "normal file",
            Self::Directory => "directory",
            Self::BitMap => "bitmap file",
            Self::Name => "name file",
            Self::Path => "path file",
        }
    }
}

/// An in-memory file header. Mutations are persisted only by an explicit
/// [`FileHeader::write_back`]; discarding the copy undoes a failed
/// operation.
#[derive(Debug, Clone)]
pub struct FileHeader {
    num_bytes: u32,
    num_sectors: u32,
    file_type: FileType,
    create_time: [u8; TIME_LENGTH + 1],
    access_time: [u8; TIME_LENGTH + 1],
    modify_time: [u8; TIME_LENGTH + 1],
    path_file_sector: Sector,
    path_length: u32,
    data_sectors: [Sector; NUM_DIRECT + 1],
}

impl FileHeader {
    /// Initialize a fresh header of `size` bytes, allocating its data
    /// blocks (and, past the direct range, its index tree) from
    /// `freemap`. Fails atomically with [`FsError::NoSpace`]: the caller
    /// discards both in-memory copies without writing anything back.
    pub fn allocate(
        kernel: &Kernel,
        freemap: &mut FreeMap,
        size: usize,
        file_type: FileType,
    ) -> Result<Self, FsError> {
        if size > MAX_FILE_SIZE {
            return Err(FsError::NoSpace);
        }
        let num_sectors = div_round_up(size, SECTOR_SIZE);
        let mut hdr = Self {
            num_bytes: size as u32,
            num_sectors: num_sectors as u32,
            file_type,
            create_time: [0; TIME_LENGTH + 1],
            access_time: [0; TIME_LENGTH + 1],
            modify_time: [0; TIME_LENGTH + 1],
            path_file_sector: 0,
            path_length: 0,
            data_sectors: [0; NUM_DIRECT + 1],
        };

        if num_sectors <= NUM_DIRECT {
            for slot in 0..num_sectors {
                hdr.data_sectors[slot] = freemap.find().ok_or(FsError::NoSpace)?;
            }
            return Ok(hdr);
        }

        for slot in 0..NUM_DIRECT {
            hdr.data_sectors[slot] = freemap.find().ok_or(FsError::NoSpace)?;
        }
        let root = freemap.find().ok_or(FsError::NoSpace)?;
        hdr.data_sectors[NUM_DIRECT] = root;

        let mut remaining = num_sectors - NUM_DIRECT;
        let mut root_table = [0 as Sector; NUM_INDIRECT];
        let mut chunk = 0;
        while remaining > 0 {
            if chunk == NUM_INDIRECT {
                return Err(FsError::NoSpace);
            }
            let index_sector = freemap.find().ok_or(FsError::NoSpace)?;
            root_table[chunk] = index_sector;
            let in_chunk = remaining.min(NUM_INDIRECT);
            let mut table = [0 as Sector; NUM_INDIRECT];
            for slot in table.iter_mut().take(in_chunk) {
                *slot = freemap.find().ok_or(FsError::NoSpace)?;
            }
            write_index_sector(kernel, index_sector, &table);
            remaining -= in_chunk;
            chunk += 1;
        }
        write_index_sector(kernel, root, &root_table);
        Ok(hdr)
    }

    /// Free every data, index and root sector the block map references.
    /// Each must still be marked allocated.
    pub fn deallocate(&self, kernel: &Kernel, freemap: &mut FreeMap) {
        let num_sectors = self.num_sectors as usize;
        if num_sectors <= NUM_DIRECT {
            for slot in 0..num_sectors {
                freemap.clear(self.data_sectors[slot]);
            }
            return;
        }
        for slot in 0..NUM_DIRECT {
            freemap.clear(self.data_sectors[slot]);
        }
        let root = self.data_sectors[NUM_DIRECT];
        let root_table = read_index_sector(kernel, root);
        let mut remaining = num_sectors - NUM_DIRECT;
        let mut chunk = 0;
        while remaining > 0 {
            let table = read_index_sector(kernel, root_table[chunk]);
            let in_chunk = remaining.min(NUM_INDIRECT);
            for &sector in table.iter().take(in_chunk) {
                freemap.clear(sector);
            }
            freemap.clear(root_table[chunk]);
            remaining -= in_chunk;
            chunk += 1;
        }
        freemap.clear(root);
    }

    /// Grow an already-allocated file to `new_size` bytes. Only sectors
    /// beyond the current tail are newly allocated; existing data stays
    /// where it is. On failure the in-memory header and map are simply
    /// discarded by the caller.
    pub fn expand(
        &mut self,
        kernel: &Kernel,
        freemap: &mut FreeMap,
        new_size: usize,
    ) -> Result<(), FsError> {
        assert!(new_size as u32 >= self.num_bytes, "expand only grows files");
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::NoSpace);
        }
        let old_sectors = self.num_sectors as usize;
        let new_sectors = div_round_up(new_size, SECTOR_SIZE);
        if new_sectors == old_sectors {
            self.num_bytes = new_size as u32;
            return Ok(());
        }

        let had_root = old_sectors > NUM_DIRECT;
        let mut root_table = [0 as Sector; NUM_INDIRECT];
        let mut root_dirty = false;
        if had_root {
            root_table = read_index_sector(kernel, self.data_sectors[NUM_DIRECT]);
        }
        // Chunks that already exist, and the per-chunk tables we touch.
        let old_chunks = old_sectors.saturating_sub(NUM_DIRECT).div_ceil(NUM_INDIRECT);
        let mut tables: Vec<(usize, [Sector; NUM_INDIRECT], bool)> = Vec::new();

        for s in old_sectors..new_sectors {
            if s < NUM_DIRECT {
                self.data_sectors[s] = freemap.find().ok_or(FsError::NoSpace)?;
                continue;
            }
            if !had_root && s == NUM_DIRECT {
                self.data_sectors[NUM_DIRECT] = freemap.find().ok_or(FsError::NoSpace)?;
                root_dirty = true;
            }
            let linear = s - NUM_DIRECT;
            let chunk = linear / NUM_INDIRECT;
            if chunk >= NUM_INDIRECT {
                return Err(FsError::NoSpace);
            }
            let pos = linear % NUM_INDIRECT;
            let loaded = tables.iter().position(|(c, _, _)| *c == chunk);
            let entry = match loaded {
                Some(i) => i,
                None => {
                    if chunk < old_chunks {
                        tables.push((chunk, read_index_sector(kernel, root_table[chunk]), false));
                    } else {
                        root_table[chunk] = freemap.find().ok_or(FsError::NoSpace)?;
                        root_dirty = true;
                        tables.push((chunk, [0; NUM_INDIRECT], true));
                    }
                    tables.len() - 1
                }
            };
            tables[entry].1[pos] = freemap.find().ok_or(FsError::NoSpace)?;
            tables[entry].2 = true;
        }

        for (chunk, table, dirty) in &tables {
            if *dirty {
                write_index_sector(kernel, root_table[*chunk], table);
            }
        }
        if root_dirty {
            write_index_sector(kernel, self.data_sectors[NUM_DIRECT], &root_table);
        }
        self.num_sectors = new_sectors as u32;
        self.num_bytes = new_size as u32;
        Ok(())
    }

    /// The sector holding the byte at `offset`, translating through the
    /// direct slots or the two-level indirect tree.
    pub fn byte_to_sector(&self, kernel: &Kernel, offset: usize) -> Sector {
        let direct_span = NUM_DIRECT * SECTOR_SIZE;
        if offset < direct_span {
            return self.data_sectors[offset / SECTOR_SIZE];
        }
        let linear = offset - direct_span;
        let span_per_index = NUM_INDIRECT * SECTOR_SIZE;
        let root_table = read_index_sector(kernel, self.data_sectors[NUM_DIRECT]);
        let table = read_index_sector(kernel, root_table[linear / span_per_index]);
        table[(linear % span_per_index) / SECTOR_SIZE]
    }

    pub fn fetch_from(kernel: &Kernel, sector: Sector) -> Self {
        let mut raw = [0u8; SECTOR_SIZE];
        kernel.synch_disk.read_sector(kernel, sector, &mut raw);
        Self::from_sector(&raw)
    }

    pub fn write_back(&self, kernel: &Kernel, sector: Sector) {
        kernel.synch_disk.write_sector(kernel, sector, &self.to_sector());
    }

    pub fn file_length(&self) -> usize {
        self.num_bytes as usize
    }

    pub fn num_sectors(&self) -> usize {
        self.num_sectors as usize
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    // ========================================================================
    // Timestamps and the path back-reference
    // ========================================================================

    pub fn set_create_time(&mut self, kernel: &Kernel) {
        self.create_time = kernel.interrupt.timestamp();
    }

    pub fn set_access_time(&mut self, kernel: &Kernel) {
        self.access_time = kernel.interrupt.timestamp();
    }

    pub fn set_modify_time(&mut self, kernel: &Kernel) {
        self.modify_time = kernel.interrupt.timestamp();
    }

    pub fn create_time(&self) -> String {
        stamp_text(&self.create_time)
    }

    pub fn access_time(&self) -> String {
        stamp_text(&self.access_time)
    }

    pub fn modify_time(&self) -> String {
        stamp_text(&self.modify_time)
    }

    pub fn set_path(&mut self, sector: Sector, length: u32) {
        self.path_file_sector = sector;
        self.path_length = length;
    }

    pub fn path_file_sector(&self) -> Sector {
        self.path_file_sector
    }

    pub fn path_length(&self) -> u32 {
        self.path_length
    }

    /// Read the absolute path back from the Path File, without walking
    /// the directory tree. The stored string is NUL-terminated.
    pub fn path_string(&self, kernel: &Kernel) -> String {
        let path_file = OpenFile::new(self.path_file_sector);
        let mut raw = vec![0u8; self.path_length as usize];
        path_file.read_at(kernel, &mut raw, 0);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// Human-readable dump of the header and the file's contents.
    pub fn print(&self, kernel: &Kernel) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "file type: {}", self.file_type.name());
        if self.file_type.keeps_timestamps() {
            let _ = writeln!(out, "create time: {}", stamp_text(&self.create_time));
            let _ = writeln!(out, "last access time: {}", stamp_text(&self.access_time));
            let _ = writeln!(out, "last modify time: {}", stamp_text(&self.modify_time));
            let _ = writeln!(out, "path: {}", self.path_string(kernel));
        }
        let _ = writeln!(out, "file size: {}", self.num_bytes);
        let sectors: Vec<String> = (0..self.num_sectors as usize)
            .map(|s| self.byte_to_sector(kernel, s * SECTOR_SIZE).to_string())
            .collect();
        let _ = writeln!(out, "file blocks: {}", sectors.join(" "));
        let mut printed = 0usize;
        let mut text = String::new();
        for s in 0..self.num_sectors as usize {
            let mut raw = [0u8; SECTOR_SIZE];
            kernel
                .synch_disk
                .read_sector(kernel, self.byte_to_sector(kernel, s * SECTOR_SIZE), &mut raw);
            for &b in raw.iter() {
                if printed == self.num_bytes as usize {
                    break;
                }
                if (0x20..0x7f).contains(&b) {
                    text.push(b as char);
                } else {
                    let _ = write!(text, "\\{b:x}");
                }
                printed += 1;
            }
        }
        let _ = writeln!(out, "file contents:\n{text}");
        out
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    fn to_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut raw = [0u8; SECTOR_SIZE];
        put_u32(&mut raw, OFF_NUM_BYTES, self.num_bytes);
        put_u32(&mut raw, OFF_NUM_SECTORS, self.num_sectors);
        put_u32(&mut raw, OFF_TYPE, self.file_type as u32);
        raw[OFF_CREATE..OFF_CREATE + 25].copy_from_slice(&self.create_time);
        raw[OFF_ACCESS..OFF_ACCESS + 25].copy_from_slice(&self.access_time);
        raw[OFF_MODIFY..OFF_MODIFY + 25].copy_from_slice(&self.modify_time);
        put_u32(&mut raw, OFF_PATH_SECTOR, self.path_file_sector);
        put_u32(&mut raw, OFF_PATH_LEN, self.path_length);
        for (i, &sector) in self.data_sectors.iter().enumerate() {
            put_u32(&mut raw, OFF_DATA + i * 4, sector);
        }
        raw
    }

    fn from_sector(raw: &[u8; SECTOR_SIZE]) -> Self {
        let mut hdr = Self {
            num_bytes: get_u32(raw, OFF_NUM_BYTES),
            num_sectors: get_u32(raw, OFF_NUM_SECTORS),
            file_type: FileType::from_u32(get_u32(raw, OFF_TYPE)),
            create_time: [0; 25],
            access_time: [0; 25],
            modify_time: [0; 25],
            path_file_sector: get_u32(raw, OFF_PATH_SECTOR),
            path_length: get_u32(raw, OFF_PATH_LEN),
            data_sectors: [0; NUM_DIRECT + 1],
        };
        hdr.create_time.copy_from_slice(&raw[OFF_CREATE..OFF_CREATE + 25]);
        hdr.access_time.copy_from_slice(&raw[OFF_ACCESS..OFF_ACCESS + 25]);
        hdr.modify_time.copy_from_slice(&raw[OFF_MODIFY..OFF_MODIFY + 25]);
        for i in 0..NUM_DIRECT + 1 {
            hdr.data_sectors[i] = get_u32(raw, OFF_DATA + i * 4);
        }
        hdr
    }
}

fn stamp_text(stamp: &[u8; TIME_LENGTH + 1]) -> String {
    let end = stamp.iter().position(|&b| b == 0).unwrap_or(TIME_LENGTH);
    String::from_utf8_lossy(&stamp[..end]).into_owned()
}

fn write_index_sector(kernel: &Kernel, sector: Sector, table: &[Sector; NUM_INDIRECT]) {
    let mut raw = [0u8; SECTOR_SIZE];
    for (i, &entry) in table.iter().enumerate() {
        put_u32(&mut raw, i * 4, entry);
    }
    kernel.synch_disk.write_sector(kernel, sector, &raw);
}

fn read_index_sector(kernel: &Kernel, sector: Sector) -> [Sector; NUM_INDIRECT] {
    let mut raw = [0u8; SECTOR_SIZE];
    kernel.synch_disk.read_sector(kernel, sector, &mut raw);
    let mut table = [0 as Sector; NUM_INDIRECT];
    for (i, entry) in table.iter_mut().enumerate() {
        *entry = get_u32(&raw, i * 4);
    }
    table
}
