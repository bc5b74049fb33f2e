//! Directories.
//!
//! A directory body is a table of fixed-size entries followed by two
//! scalars. Entries hold no name text: each records a position and length
//! in the directory's own Name File, where names are appended
//! NUL-terminated and never reclaimed (removal just frees the table
//! entry, so name bytes leak by design). When every slot is in use the
//! table grows by one entry; entries are never renumbered.
//!
//! Every directory is born with `.` (itself) and `..` (its parent); the
//! root is its own parent.
//!
//! On-disk image: `table_len * 16` bytes of entries
//! `(in_use, sector, name_position, name_length)` as little-endian u32
//! quadruples, then `name_file_sector` and `name_file_position`.

use crate::fs::open_file::OpenFile;
use crate::fs::FsError;
use crate::types::Sector;
use crate::utilities::{get_u32, put_u32};
use crate::Kernel;

/// Initial entry capacity of a new directory.
pub const NUM_DIR_ENTRIES: usize = 10;
/// Bytes per on-disk directory entry.
pub const DIR_ENTRY_SIZE: usize = 16;

/// Byte size of a directory file with `entries` table slots.
pub fn directory_file_size(entries: usize) -> usize {
    entries * DIR_ENTRY_SIZE + 8
}

#[derive(Debug, Clone, Copy)]
pub struct DirectoryEntry {
    pub in_use: bool,
    pub sector: Sector,
    pub name_position: u32,
    pub name_length: u32,
}

impl DirectoryEntry {
    fn free() -> Self {
        Self {
            in_use: false,
            sector: 0,
            name_position: 0,
            name_length: 0,
        }
    }
}

/// In-memory copy of one directory.
#[derive(Debug)]
pub struct Directory {
    table: Vec<DirectoryEntry>,
    name_file_sector: Option<Sector>,
    name_file_position: u32,
}

impl Directory {
    /// An empty directory with `size` table slots and no Name File yet.
    pub fn new(size: usize) -> Self {
        Self {
            table: (0..size).map(|_| DirectoryEntry::free()).collect(),
            name_file_sector: None,
            name_file_position: 0,
        }
    }

    /// Attach the Name File created for this directory.
    pub fn init_name_file(&mut self, sector: Sector) {
        self.name_file_sector = Some(sector);
        self.name_file_position = 0;
    }

    pub fn name_file_sector(&self) -> Sector {
        self.name_file_sector.expect("directory has a name file")
    }

    /// Load a directory from its open body file; the table length comes
    /// from the file's size.
    pub fn fetch_from(kernel: &Kernel, file: &OpenFile) -> Self {
        let len = file.length(kernel);
        let entries = (len - 8) / DIR_ENTRY_SIZE;
        let mut raw = vec![0u8; len];
        let got = file.read_at(kernel, &mut raw, 0);
        debug_assert_eq!(got, len);

        let mut dir = Self::new(entries);
        for (i, entry) in dir.table.iter_mut().enumerate() {
            let off = i * DIR_ENTRY_SIZE;
            entry.in_use = get_u32(&raw, off) != 0;
            entry.sector = get_u32(&raw, off + 4);
            entry.name_position = get_u32(&raw, off + 8);
            entry.name_length = get_u32(&raw, off + 12);
        }
        let scalars = entries * DIR_ENTRY_SIZE;
        dir.name_file_sector = Some(get_u32(&raw, scalars));
        dir.name_file_position = get_u32(&raw, scalars + 4);
        dir
    }

    /// Persist the table (possibly grown) and scalars through the body
    /// file.
    pub fn write_back(&self, kernel: &Kernel, file: &OpenFile) {
        let mut raw = vec![0u8; directory_file_size(self.table.len())];
        for (i, entry) in self.table.iter().enumerate() {
            let off = i * DIR_ENTRY_SIZE;
            put_u32(&mut raw, off, entry.in_use as u32);
            put_u32(&mut raw, off + 4, entry.sector);
            put_u32(&mut raw, off + 8, entry.name_position);
            put_u32(&mut raw, off + 12, entry.name_length);
        }
        let scalars = self.table.len() * DIR_ENTRY_SIZE;
        put_u32(&mut raw, scalars, self.name_file_sector());
        put_u32(&mut raw, scalars + 4, self.name_file_position);
        file.write_at(kernel, &raw, 0);
    }

    /// The name of the in-use entry at `index`, read from the Name File.
    pub fn entry_name(&self, kernel: &Kernel, index: usize) -> String {
        let entry = &self.table[index];
        debug_assert!(entry.in_use);
        let name_file = OpenFile::new(self.name_file_sector());
        let mut raw = vec![0u8; entry.name_length as usize];
        name_file.read_at(kernel, &mut raw, entry.name_position as usize);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    fn find_index(&self, kernel: &Kernel, name: &str) -> Option<usize> {
        let name_file = OpenFile::new(self.name_file_sector());
        let wanted = name.as_bytes();
        for (i, entry) in self.table.iter().enumerate() {
            if !entry.in_use {
                continue;
            }
            let mut raw = vec![0u8; entry.name_length as usize];
            name_file.read_at(kernel, &mut raw, entry.name_position as usize);
            // Stored names are NUL-terminated.
            if raw.len() == wanted.len() + 1 && &raw[..wanted.len()] == wanted && raw[wanted.len()] == 0
            {
                return Some(i);
            }
        }
        None
    }

    /// Sector of the file header for `name`, if present.
    pub fn find(&self, kernel: &Kernel, name: &str) -> Option<Sector> {
        self.find_index(kernel, name).map(|i| self.table[i].sector)
    }

    /// Install `name -> sector`. The name is appended to the Name File
    /// immediately; the table grows by one entry when full.
    pub fn add(&mut self, kernel: &Kernel, name: &str, sector: Sector) -> Result<(), FsError> {
        if self.find_index(kernel, name).is_some() {
            return Err(FsError::NameCollision);
        }
        let name_file = OpenFile::new(self.name_file_sector());
        let mut stored = name.as_bytes().to_vec();
        stored.push(0);
        name_file.write_at(kernel, &stored, self.name_file_position as usize);

        let slot = match self.table.iter().position(|e| !e.in_use) {
            Some(free) => free,
            None => {
                self.table.push(DirectoryEntry::free());
                self.table.len() - 1
            }
        };
        self.table[slot] = DirectoryEntry {
            in_use: true,
            sector,
            name_position: self.name_file_position,
            name_length: stored.len() as u32,
        };
        self.name_file_position += stored.len() as u32;
        Ok(())
    }

    /// Free the entry for `name`; its bytes in the Name File stay behind.
    pub fn remove(&mut self, kernel: &Kernel, name: &str) -> bool {
        match self.find_index(kernel, name) {
            Some(i) => {
                self.table[i].in_use = false;
                true
            }
            None => false,
        }
    }

    /// Empty, ignoring the two reserved `.`/`..` entries.
    pub fn is_empty(&self) -> bool {
        self.table.iter().skip(2).all(|e| !e.in_use)
    }

    /// All in-use names, in table order.
    pub fn list(&self, kernel: &Kernel) -> Vec<String> {
        self.table
            .iter()
            .enumerate()
            .filter(|(_, e)| e.in_use)
            .map(|(i, _)| self.entry_name(kernel, i))
            .collect()
    }

    /// Verbose recursive dump: every entry, its header, and (for child
    /// directories) their contents.
    pub fn print(&self, kernel: &Kernel, out: &mut String) {
        use std::fmt::Write;

        let _ = writeln!(out, "directory contents:");
        for (i, entry) in self.table.iter().enumerate() {
            if !entry.in_use {
                continue;
            }
            let name = self.entry_name(kernel, i);
            if name == "." || name == ".." {
                continue;
            }
            let _ = writeln!(out, "name: {name}, sector: {}", entry.sector);
            let hdr = crate::fs::file_header::FileHeader::fetch_from(kernel, entry.sector);
            out.push_str(&hdr.print(kernel));
            if hdr.file_type() == crate::fs::file_header::FileType::Directory {
                let child_file = OpenFile::new(entry.sector);
                let child = Directory::fetch_from(kernel, &child_file);
                child.print(kernel, out);
            }
        }
    }
}
