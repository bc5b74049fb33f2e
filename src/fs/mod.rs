//! The file system.
//!
//! Layout on disk: the free-sector bitmap's header at sector 0 and the
//! root directory's header at sector 1, both kept open for the kernel's
//! lifetime. Every other file is reached by walking absolute paths
//! through the directory tree. Each file carries a Path File recording
//! the absolute path it was created under; each directory carries a Name
//! File holding its entries' name strings.
//!
//! Mutating operations follow the discipline that makes failure
//! reversible: fetch in-memory copies of the bitmap and directory,
//! mutate them, and persist only once the whole operation has succeeded.
//! On any failure the copies are dropped unwritten.

pub mod bitmap;
pub mod directory;
pub mod file_header;
pub mod open_file;
pub mod pipe;
pub mod synch_disk;

use thiserror::Error;

use crate::types::{Sector, SECTOR_SIZE};
use crate::Kernel;
use bitmap::{FreeMap, FREE_MAP_FILE_SIZE};
use directory::{directory_file_size, Directory, NUM_DIR_ENTRIES};
use file_header::{FileHeader, FileType};
use open_file::OpenFile;
pub use synch_disk::SynchDisk;

/// Sector of the free-map file header.
pub const FREE_MAP_SECTOR: Sector = 0;
/// Sector of the root directory file header.
pub const DIRECTORY_SECTOR: Sector = 1;

/// Why a file-system operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// A component of an absolute path did not resolve.
    #[error("path error")]
    PathError,
    /// The name already exists in the target directory.
    #[error("name collision")]
    NameCollision,
    /// The disk has no free sectors for the request.
    #[error("no free sectors")]
    NoSpace,
    /// The leaf name does not exist.
    #[error("not found")]
    NotFound,
    /// Refusing to remove a directory that still has entries.
    #[error("directory not empty")]
    DirectoryNotEmpty,
}

/// The file system façade. Holds the two files every operation needs:
/// the free map and the root directory.
#[derive(Debug)]
pub struct FileSystem {
    free_map_file: OpenFile,
    directory_file: OpenFile,
}

impl FileSystem {
    /// Attach to an already-formatted disk.
    pub(crate) fn new() -> Self {
        Self {
            free_map_file: OpenFile::new(FREE_MAP_SECTOR),
            directory_file: OpenFile::new(DIRECTORY_SECTOR),
        }
    }

    /// Lay down an empty file system: bitmap, root directory with its
    /// `.`/`..` entries, the root's Path File ("/") and Name File.
    pub(crate) fn format(&self, kernel: &Kernel) {
        log::debug!(target: "minnow::fs", "formatting the file system");
        let mut freemap = FreeMap::new();
        freemap.mark(FREE_MAP_SECTOR);
        freemap.mark(DIRECTORY_SECTOR);

        let map_hdr = FileHeader::allocate(kernel, &mut freemap, FREE_MAP_FILE_SIZE, FileType::BitMap)
            .expect("fresh disk fits the free map");
        let mut dir_hdr = FileHeader::allocate(
            kernel,
            &mut freemap,
            directory_file_size(NUM_DIR_ENTRIES),
            FileType::Directory,
        )
        .expect("fresh disk fits the root directory");
        dir_hdr.set_create_time(kernel);
        dir_hdr.set_access_time(kernel);
        dir_hdr.set_modify_time(kernel);

        let path_sector = freemap.find().expect("fresh disk has a path sector");
        let path_hdr = FileHeader::allocate(kernel, &mut freemap, SECTOR_SIZE, FileType::Path)
            .expect("fresh disk fits the root path file");
        path_hdr.write_back(kernel, path_sector);
        dir_hdr.set_path(path_sector, 2);

        map_hdr.write_back(kernel, FREE_MAP_SECTOR);
        dir_hdr.write_back(kernel, DIRECTORY_SECTOR);

        let root_path = OpenFile::new(path_sector);
        root_path.write_at(kernel, b"/\0", 0);

        let name_sector = freemap.find().expect("fresh disk has a name sector");
        let name_hdr = FileHeader::allocate(kernel, &mut freemap, SECTOR_SIZE, FileType::Name)
            .expect("fresh disk fits the root name file");
        name_hdr.write_back(kernel, name_sector);

        let mut root = Directory::new(NUM_DIR_ENTRIES);
        root.init_name_file(name_sector);
        root.add(kernel, ".", DIRECTORY_SECTOR).expect("fresh directory");
        root.add(kernel, "..", DIRECTORY_SECTOR).expect("fresh directory");

        freemap.write_back(kernel, &self.free_map_file);
        root.write_back(kernel, &self.directory_file);
    }

    /// Resolve the parent directory of an absolute path: walk every
    /// segment but the last from the root, returning the parent's header
    /// sector.
    pub fn find_dir(&self, kernel: &Kernel, path: &str) -> Result<Sector, FsError> {
        let mut rest = path.strip_prefix('/').ok_or(FsError::PathError)?;
        let mut sector = DIRECTORY_SECTOR;
        while let Some(slash) = rest.find('/') {
            let segment = &rest[..slash];
            if segment.is_empty() {
                return Err(FsError::PathError);
            }
            let dir_file = OpenFile::new(sector);
            let dir = Directory::fetch_from(kernel, &dir_file);
            sector = dir.find(kernel, segment).ok_or(FsError::PathError)?;
            rest = &rest[slash + 1..];
        }
        Ok(sector)
    }

    /// Create a file of `Some(size)` bytes, or a directory with default
    /// capacity for `None`.
    pub fn create(&self, kernel: &Kernel, path: &str, size: Option<u32>) -> Result<(), FsError> {
        log::debug!(target: "minnow::fs", "create {path}, size {size:?}");
        let parent_sector = self.find_dir(kernel, path)?;
        let name = leaf_name(path);
        if name.is_empty() {
            return Err(FsError::PathError);
        }
        let parent_hdr = FileHeader::fetch_from(kernel, parent_sector);
        let parent_file = OpenFile::new(parent_sector);
        let mut directory = Directory::fetch_from(kernel, &parent_file);

        let (file_type, size) = match size {
            None => (
                FileType::Directory,
                directory_file_size(NUM_DIR_ENTRIES) as u32,
            ),
            Some(bytes) => (FileType::Normal, bytes),
        };

        let mut freemap = FreeMap::fetch_from(kernel, &self.free_map_file);

        // A new directory needs its Name File before any entry can be
        // added. Written early; on a later failure its sectors simply
        // stay free in the persisted map.
        let mut name_sector = None;
        if file_type == FileType::Directory {
            let sector = freemap.find().ok_or(FsError::NoSpace)?;
            let name_hdr = FileHeader::allocate(kernel, &mut freemap, SECTOR_SIZE, FileType::Name)?;
            name_hdr.write_back(kernel, sector);
            name_sector = Some(sector);
        }

        if directory.find(kernel, name).is_some() {
            return Err(FsError::NameCollision);
        }
        let sector = freemap.find().ok_or(FsError::NoSpace)?;
        let path_file_sector = freemap.find().ok_or(FsError::NoSpace)?;
        directory.add(kernel, name, sector)?;
        let mut hdr = FileHeader::allocate(kernel, &mut freemap, size as usize, file_type)?;
        let path_hdr = FileHeader::allocate(kernel, &mut freemap, SECTOR_SIZE, FileType::Path)?;

        // Everything allocated; persist the whole operation.
        hdr.set_create_time(kernel);
        hdr.set_access_time(kernel);
        hdr.set_modify_time(kernel);
        let is_dir = file_type == FileType::Directory;
        let path_length = parent_hdr.path_length() + name.len() as u32 + is_dir as u32;
        hdr.set_path(path_file_sector, path_length);

        hdr.write_back(kernel, sector);
        path_hdr.write_back(kernel, path_file_sector);
        // Bitmap first: writing the directory back may grow its body
        // file, and that growth must see these allocations.
        freemap.write_back(kernel, &self.free_map_file);
        directory.write_back(kernel, &parent_file);

        if is_dir {
            let mut child = Directory::new(NUM_DIR_ENTRIES);
            child.init_name_file(name_sector.expect("allocated above"));
            child.add(kernel, ".", sector).expect("fresh directory");
            child.add(kernel, "..", parent_sector).expect("fresh directory");
            let child_file = OpenFile::new(sector);
            child.write_back(kernel, &child_file);
        }

        let mut full_path = parent_hdr.path_string(kernel);
        full_path.push_str(name);
        if is_dir {
            full_path.push('/');
        }
        let mut stored = full_path.into_bytes();
        stored.push(0);
        debug_assert_eq!(stored.len() as u32, path_length);
        let path_file = OpenFile::new(path_file_sector);
        path_file.write_at(kernel, &stored, 0);

        Ok(())
    }

    /// Open the file at `path`.
    pub fn open(&self, kernel: &Kernel, path: &str) -> Result<OpenFile, FsError> {
        let parent_sector = self.find_dir(kernel, path)?;
        let name = leaf_name(path);
        let parent_file = OpenFile::new(parent_sector);
        let directory = Directory::fetch_from(kernel, &parent_file);
        let sector = directory.find(kernel, name).ok_or(FsError::NotFound)?;
        log::trace!(target: "minnow::fs", "open {path} -> sector {sector}");
        Ok(OpenFile::new(sector))
    }

    /// Remove the file or (empty) directory at `path`, freeing its data
    /// sectors, its Path File, a directory's Name File, and the header
    /// sector itself.
    pub fn remove(&self, kernel: &Kernel, path: &str) -> Result<(), FsError> {
        log::debug!(target: "minnow::fs", "remove {path}");
        let parent_sector = self.find_dir(kernel, path)?;
        let name = leaf_name(path);
        let parent_file = OpenFile::new(parent_sector);
        let mut directory = Directory::fetch_from(kernel, &parent_file);
        let sector = directory.find(kernel, name).ok_or(FsError::NotFound)?;

        let hdr = FileHeader::fetch_from(kernel, sector);
        let mut freemap = FreeMap::fetch_from(kernel, &self.free_map_file);

        if hdr.file_type() == FileType::Directory {
            let dir_file = OpenFile::new(sector);
            let dir = Directory::fetch_from(kernel, &dir_file);
            if !dir.is_empty() {
                return Err(FsError::DirectoryNotEmpty);
            }
            let name_hdr = FileHeader::fetch_from(kernel, dir.name_file_sector());
            name_hdr.deallocate(kernel, &mut freemap);
            freemap.clear(dir.name_file_sector());
        }

        let path_sector = hdr.path_file_sector();
        let path_hdr = FileHeader::fetch_from(kernel, path_sector);
        path_hdr.deallocate(kernel, &mut freemap);
        freemap.clear(path_sector);

        hdr.deallocate(kernel, &mut freemap);
        freemap.clear(sector);
        directory.remove(kernel, name);

        freemap.write_back(kernel, &self.free_map_file);
        directory.write_back(kernel, &parent_file);
        Ok(())
    }

    /// Names in the root directory, `.` and `..` included.
    pub fn list(&self, kernel: &Kernel) -> Vec<String> {
        let directory = Directory::fetch_from(kernel, &self.directory_file);
        directory.list(kernel)
    }

    /// Dump the bitmap, the directory tree, and every file's header and
    /// contents.
    pub fn print(&self, kernel: &Kernel) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let freemap = FreeMap::fetch_from(kernel, &self.free_map_file);
        let _ = writeln!(
            out,
            "bitmap: {} sectors free, allocated: {:?}",
            freemap.num_clear(),
            freemap.allocated()
        );
        let _ = writeln!(out, "root directory header:");
        let dir_hdr = FileHeader::fetch_from(kernel, DIRECTORY_SECTOR);
        out.push_str(&dir_hdr.print(kernel));
        let directory = Directory::fetch_from(kernel, &self.directory_file);
        directory.print(kernel, &mut out);
        out
    }

    /// Grow `hdr` to `new_size`, persisting the bitmap only on success.
    pub(crate) fn expand_file(
        &self,
        kernel: &Kernel,
        hdr: &mut FileHeader,
        new_size: usize,
    ) -> Result<(), FsError> {
        let mut freemap = FreeMap::fetch_from(kernel, &self.free_map_file);
        hdr.expand(kernel, &mut freemap, new_size)?;
        freemap.write_back(kernel, &self.free_map_file);
        Ok(())
    }

    /// Fresh copy of the persisted free map, for invariants and tests.
    pub fn free_map_snapshot(&self, kernel: &Kernel) -> FreeMap {
        FreeMap::fetch_from(kernel, &self.free_map_file)
    }
}

/// The path component after the last `/`.
fn leaf_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(at) => &path[at + 1..],
        None => path,
    }
}
