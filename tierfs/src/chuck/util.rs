//! Split a file range into per-chunk pieces.

use super::chunk::ChunkLayout;

/// A piece of a file range that falls inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_index: u64,
    /// File offset where the piece starts.
    pub file_offset: u64,
    pub offset_in_chunk: u64,
    pub len: u64,
}

/// Split `[file_offset, file_offset + len)` into chunk-local pieces, ascending.
pub fn split_file_range_into_chunks(
    layout: ChunkLayout,
    mut file_offset: u64,
    len: u64,
) -> Vec<ChunkSpan> {
    let mut remaining = len;
    let mut out = Vec::new();
    while remaining > 0 {
        let chunk_index = layout.chunk_index_of(file_offset);
        let offset_in_chunk = layout.within_chunk_offset(file_offset);
        let take = (layout.chunk_size - offset_in_chunk).min(remaining);
        out.push(ChunkSpan {
            chunk_index,
            file_offset,
            offset_in_chunk,
            len: take,
        });
        file_offset += take;
        remaining -= take;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_within_single_chunk() {
        let layout = ChunkLayout::default();
        let spans = split_file_range_into_chunks(layout, 123, 4096);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].chunk_index, 0);
        assert_eq!(spans[0].offset_in_chunk, 123);
        assert_eq!(spans[0].len, 4096);
    }

    #[test]
    fn test_split_across_two_chunks() {
        let layout = ChunkLayout::default();
        let start = layout.chunk_size - 10;
        let spans = split_file_range_into_chunks(layout, start, 100);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].chunk_index, 0);
        assert_eq!(spans[0].offset_in_chunk, layout.chunk_size - 10);
        assert_eq!(spans[0].len, 10);
        assert_eq!(spans[1].chunk_index, 1);
        assert_eq!(spans[1].file_offset, layout.chunk_size);
        assert_eq!(spans[1].offset_in_chunk, 0);
        assert_eq!(spans[1].len, 90);
    }

    #[test]
    fn test_zero_len() {
        let layout = ChunkLayout::default();
        let spans = split_file_range_into_chunks(layout, 0, 0);
        assert!(spans.is_empty());
    }
}
