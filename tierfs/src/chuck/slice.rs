//! Chunk descriptors and their mapping to block objects.
//!
//! A [`ChunkDescriptor`] records one write's placement inside a chunk index.
//! The bytes it describes are stored as block objects, numbered from the
//! start of the descriptor:
//!
//!   descriptor: |<---------------- len ---------------->|
//!   blocks:     |  block 0  |  block 1  |  block 2  |..|
//!
//! Descriptors are immutable and compared by value (all fields) when they are
//! removed or de-duplicated.

use super::chunk::ChunkLayout;
use serde::{Deserialize, Serialize};

/// Immutable record of one write inside a chunk index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Globally allocated, strictly increasing; ascending order is write order.
    pub chunk_id: u64,
    /// Non-zero when produced by compaction.
    pub compaction: u64,
    /// File offset of the first byte.
    pub offset: u64,
    pub len: u64,
    /// Logical file size observed when the descriptor was produced.
    pub size: u64,
    /// Describes a range of zeros with no backing objects.
    pub zero: bool,
}

/// Portion of a descriptor range that resides inside a single block object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub block_index: u64,
    pub offset_in_block: u64,
    pub len_in_block: u64,
}

impl ChunkDescriptor {
    pub fn new(chunk_id: u64, offset: u64, len: u64, size: u64) -> Self {
        Self {
            chunk_id,
            compaction: 0,
            offset,
            len,
            size,
            zero: false,
        }
    }

    pub fn zeroed(chunk_id: u64, offset: u64, len: u64, size: u64) -> Self {
        Self {
            zero: true,
            ..Self::new(chunk_id, offset, len, size)
        }
    }

    /// Exclusive end offset in the file.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Intersection of this descriptor with the file range `[start, end)`.
    pub fn overlap(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let lo = self.offset.max(start);
        let hi = self.end().min(end);
        (lo < hi).then_some((lo, hi))
    }

    /// Key of one block object of this descriptor.
    pub fn object_name(&self, fs_id: u32, inode_id: u64, block_index: u64) -> String {
        format!(
            "{fs_id}_{inode_id}_{}_{block_index}_{}",
            self.chunk_id, self.compaction
        )
    }

    /// Block spans covering the whole descriptor.
    pub fn block_spans(&self, layout: ChunkLayout) -> Vec<BlockSpan> {
        self.block_spans_in(layout, 0, self.len)
    }

    /// Block spans covering `[rel_start, rel_start + len)`, relative to the
    /// descriptor's first byte. Spans are ascending by block index and sum to `len`.
    pub fn block_spans_in(&self, layout: ChunkLayout, rel_start: u64, len: u64) -> Vec<BlockSpan> {
        let bs = layout.block_size;
        let mut spans = Vec::new();
        let mut cur = rel_start;
        let mut remaining = len.min(self.len.saturating_sub(rel_start));
        while remaining > 0 {
            let block_index = cur / bs;
            let offset_in_block = cur % bs;
            let take = (bs - offset_in_block).min(remaining);
            spans.push(BlockSpan {
                block_index,
                offset_in_block,
                len_in_block: take,
            });
            cur += take;
            remaining -= take;
        }
        spans
    }
}
