//! Memory-mapped archive input.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::Result;

/// The whole archive, memory-mapped read-only for the duration of a run.
///
/// Chunks stored uncompressed in the PBZX stream borrow directly from this
/// map, so it lives behind an `Arc` and is released only after the last file
/// holding such a chunk has been materialized.
pub struct MappedArchive {
    map: Mmap,
}

impl MappedArchive {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let file = File::open(path)?;
        // Safety: the map is read-only and the archive must not be truncated
        // or rewritten while extraction runs.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Arc::new(MappedArchive { map }))
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}
