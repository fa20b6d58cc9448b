//! Chunk layout and indexing helpers.
//!
//! A file is cut into fixed-size chunks; the chunk index of a byte is
//! `floor(file_offset / chunk_size)`. Inside a chunk, data written by one
//! descriptor is stored as fixed-size block objects.

use serde::{Deserialize, Serialize};

/// Default chunk size (64 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
/// Default block size (4 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Layout parameters for chunks and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkLayout {
    pub chunk_size: u64,
    pub block_size: u64,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ChunkLayout {
    pub fn new(chunk_size: u64, block_size: u64) -> Self {
        Self {
            chunk_size,
            block_size,
        }
    }

    #[inline]
    pub fn chunk_index_of(&self, file_offset: u64) -> u64 {
        file_offset / self.chunk_size
    }

    #[inline]
    pub fn within_chunk_offset(&self, file_offset: u64) -> u64 {
        file_offset % self.chunk_size
    }

    /// File byte range `[start, end)` covered by a chunk index.
    #[inline]
    pub fn chunk_byte_range(&self, chunk_index: u64) -> (u64, u64) {
        let start = chunk_index * self.chunk_size;
        (start, start + self.chunk_size)
    }

    #[inline]
    pub fn blocks_per_chunk(&self) -> u64 {
        self.chunk_size.div_ceil(self.block_size)
    }

    /// Layout is usable: both sizes non-zero and blocks tile a chunk exactly.
    pub fn is_valid(&self) -> bool {
        self.block_size > 0 && self.chunk_size > 0 && self.chunk_size % self.block_size == 0
    }
}
