use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use memmap2::Mmap;

/// Byte-range source for recording data, local or remote
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Total source size in bytes
    fn total_len(&self) -> u64;
}

/// Local-file source over a read-only memory map
pub struct FileSource {
    mmap: Mmap,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }
}

#[async_trait]
impl DataSource for FileSource {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + length;
        if end > self.mmap.len() {
            bail!(
                "read of bytes [{}, {}) exceeds source length {}",
                start,
                end,
                self.mmap.len()
            );
        }
        Ok(self.mmap[start..end].to_vec())
    }

    fn total_len(&self) -> u64 {
        self.mmap.len() as u64
    }
}
