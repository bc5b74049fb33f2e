//! The free-sector map, persisted as a regular file.
//!
//! Bit `i` set means sector `i` is allocated. The map's own file header
//! lives at the well-known sector 0; operations fetch a fresh in-memory
//! copy, mutate it, and write it back only when the whole operation
//! succeeded, which is what makes failed allocations reversible.

use crate::fs::open_file::OpenFile;
use crate::types::{Sector, NUM_SECTORS};
use crate::utilities::Bitmap;
use crate::Kernel;

/// Size in bytes of the bitmap's backing file.
pub const FREE_MAP_FILE_SIZE: usize = NUM_SECTORS / 8;

/// In-memory copy of the free-sector map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeMap {
    map: Bitmap,
}

impl FreeMap {
    /// A map with every sector free, for formatting.
    pub fn new() -> Self {
        Self {
            map: Bitmap::new(NUM_SECTORS),
        }
    }

    /// Load the persisted map through its open backing file.
    pub fn fetch_from(kernel: &Kernel, file: &OpenFile) -> Self {
        let mut bytes = vec![0u8; FREE_MAP_FILE_SIZE];
        let got = file.read_at(kernel, &mut bytes, 0);
        debug_assert_eq!(got, FREE_MAP_FILE_SIZE);
        let mut map = Bitmap::new(NUM_SECTORS);
        map.load_bytes(&bytes);
        Self { map }
    }

    /// Persist the map through its open backing file.
    pub fn write_back(&self, kernel: &Kernel, file: &OpenFile) {
        let put = file.write_at(kernel, &self.map.as_bytes(), 0);
        debug_assert_eq!(put, FREE_MAP_FILE_SIZE);
    }

    /// Allocate the lowest-numbered free sector.
    pub fn find(&mut self) -> Option<Sector> {
        self.map.find().map(|s| s as Sector)
    }

    pub fn mark(&mut self, sector: Sector) {
        self.map.mark(sector as usize);
    }

    /// Free `sector`; it must be allocated.
    pub fn clear(&mut self, sector: Sector) {
        self.map.clear(sector as usize);
    }

    pub fn test(&self, sector: Sector) -> bool {
        self.map.test(sector as usize)
    }

    pub fn num_clear(&self) -> usize {
        self.map.num_clear()
    }

    /// Every allocated sector, for diagnostics.
    pub fn allocated(&self) -> Vec<Sector> {
        (0..NUM_SECTORS as Sector).filter(|&s| self.test(s)).collect()
    }
}

impl Default for FreeMap {
    fn default() -> Self {
        Self::new()
    }
}
