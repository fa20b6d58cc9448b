//! ChunkReader：根据描述符列表读取 chunk 内的一段数据，支持跨块、覆盖与洞零填充。

use super::chunk::ChunkLayout;
use super::slice::ChunkDescriptor;
use super::store::BlockStore;
use crate::error::{Error, Result};
use futures::future::try_join_all;

pub struct ChunkReader<'a, S: BlockStore> {
    layout: ChunkLayout,
    fs_id: u32,
    inode_id: u64,
    store: &'a S,
}

impl<'a, S: BlockStore> ChunkReader<'a, S> {
    pub fn new(layout: ChunkLayout, fs_id: u32, inode_id: u64, store: &'a S) -> Self {
        Self {
            layout,
            fs_id,
            inode_id,
            store,
        }
    }

    /// 读取文件区间 `[file_offset, file_offset + len)`，该区间须落在同一 chunk 内。
    ///
    /// 按 chunk_id 升序依次覆盖：较新的描述符覆盖较旧的；零描述符与洞读出 0。
    pub async fn read(
        &self,
        descs: &[ChunkDescriptor],
        file_offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        if len == 0 {
            return Ok(out);
        }
        let end = file_offset + len as u64;
        let mut ordered: Vec<&ChunkDescriptor> = descs.iter().collect();
        ordered.sort_by_key(|d| d.chunk_id);

        for desc in ordered {
            let Some((lo, hi)) = desc.overlap(file_offset, end) else {
                continue;
            };
            let dst_start = (lo - file_offset) as usize;
            if desc.zero {
                out[dst_start..(hi - file_offset) as usize].fill(0);
                continue;
            }
            let spans = desc.block_spans_in(self.layout, lo - desc.offset, hi - lo);
            let parts = try_join_all(spans.iter().map(|sp| async move {
                let name = desc.object_name(self.fs_id, self.inode_id, sp.block_index);
                let part = self
                    .store
                    .get_block(&name, sp.offset_in_block, sp.len_in_block as usize)
                    .await?;
                part.ok_or(Error::NotFound(name))
            }))
            .await?;

            let mut cursor = dst_start;
            for (sp, part) in spans.iter().zip(parts) {
                let want = sp.len_in_block as usize;
                let n = part.len().min(want);
                out[cursor..cursor + n].copy_from_slice(&part[..n]);
                // 对象比预期短时，剩余部分保持为 0
                out[cursor + n..cursor + want].fill(0);
                cursor += want;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chuck::store::InMemoryBlockStore;
    use crate::chuck::writer::ChunkWriter;
    use bytes::Bytes;

    fn layout() -> ChunkLayout {
        ChunkLayout::new(4096, 1024)
    }

    #[tokio::test]
    async fn test_reader_zero_fills_holes() {
        let store = InMemoryBlockStore::new();
        // 只写第二个 block 的前半
        let w = ChunkWriter::new(layout(), 1, 7, &store);
        let d = w
            .write(1, 1024, Bytes::from(vec![1u8; 512]), 1536)
            .await
            .unwrap();

        let r = ChunkReader::new(layout(), 1, 7, &store);
        // 读取从第一个 block 后半到第二个 block 前半
        let res = r.read(&[d], 512, 1024).await.unwrap();
        assert_eq!(res.len(), 1024);
        assert!(res[..512].iter().all(|&b| b == 0));
        assert!(res[512..].iter().all(|&b| b == 1));
    }

    #[tokio::test]
    async fn test_later_chunk_id_wins() {
        let store = InMemoryBlockStore::new();
        let w = ChunkWriter::new(layout(), 1, 7, &store);
        let old = w
            .write(10, 0, Bytes::from(vec![1u8; 3000]), 3000)
            .await
            .unwrap();
        let new = w
            .write(11, 1000, Bytes::from(vec![2u8; 100]), 3000)
            .await
            .unwrap();
        let zero = ChunkDescriptor::zeroed(12, 2000, 500, 3000);

        let r = ChunkReader::new(layout(), 1, 7, &store);
        // 列表顺序无关，以 chunk_id 为准
        let out = r.read(&[zero, new, old], 900, 2000).await.unwrap();
        assert!(out[..100].iter().all(|&b| b == 1));
        assert!(out[100..200].iter().all(|&b| b == 2));
        assert!(out[200..1100].iter().all(|&b| b == 1));
        assert!(out[1100..1600].iter().all(|&b| b == 0));
        assert!(out[1600..].iter().all(|&b| b == 1));
    }

    #[tokio::test]
    async fn test_missing_block_is_error() {
        let store = InMemoryBlockStore::new();
        let d = ChunkDescriptor::new(5, 0, 10, 10);
        let r = ChunkReader::new(layout(), 1, 7, &store);
        let err = r.read(&[d], 0, 10).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
