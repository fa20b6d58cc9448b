//! ChunkWriter：将 chunk 内的一次写入拆分为块对象并写入块存储，生成描述符。

use super::chunk::ChunkLayout;
use super::slice::ChunkDescriptor;
use super::store::BlockStore;
use crate::error::Result;
use bytes::Bytes;
use futures::future::try_join_all;
use tracing::trace;

pub struct ChunkWriter<'a, S: BlockStore> {
    layout: ChunkLayout,
    fs_id: u32,
    inode_id: u64,
    store: &'a S,
}

impl<'a, S: BlockStore> ChunkWriter<'a, S> {
    pub fn new(layout: ChunkLayout, fs_id: u32, inode_id: u64, store: &'a S) -> Self {
        Self {
            layout,
            fs_id,
            inode_id,
            store,
        }
    }

    /// 将位于单个 chunk 内的写入（file_offset + buf）按 block 拆分并发写入。
    ///
    /// `file_size` 为写入后的文件长度。所有块写入成功后才返回描述符。
    pub async fn write(
        &self,
        chunk_id: u64,
        file_offset: u64,
        buf: Bytes,
        file_size: u64,
    ) -> Result<ChunkDescriptor> {
        debug_assert!(
            self.layout.chunk_index_of(file_offset)
                == self
                    .layout
                    .chunk_index_of(file_offset + (buf.len() as u64).max(1) - 1),
            "write crosses a chunk boundary"
        );
        let desc = ChunkDescriptor::new(chunk_id, file_offset, buf.len() as u64, file_size);
        let mut cursor = 0usize;
        let mut puts = Vec::new();
        for sp in desc.block_spans(self.layout) {
            let take = sp.len_in_block as usize;
            let name = desc.object_name(self.fs_id, self.inode_id, sp.block_index);
            let data = buf.slice(cursor..cursor + take);
            cursor += take;
            puts.push(async move {
                trace!("put block {name} ({take} bytes)");
                self.store.put_block(&name, data).await
            });
        }
        try_join_all(puts).await?;
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chuck::store::InMemoryBlockStore;

    #[tokio::test]
    async fn test_writer_cross_blocks() {
        let layout = ChunkLayout::new(4096, 1024);
        let store = InMemoryBlockStore::new();
        let writer = ChunkWriter::new(layout, 1, 9, &store);

        // 写入从半个 block 开始，长度为一个半 block
        let len = 1536usize;
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let desc = writer
            .write(77, 512, Bytes::from(data.clone()), 2048)
            .await
            .unwrap();
        assert_eq!(desc.offset, 512);
        assert_eq!(desc.len as usize, len);
        assert_eq!(desc.size, 2048);
        assert!(!desc.zero);

        // 块编号相对描述符起点
        let b0 = store.get_block("1_9_77_0_0", 0, 1024).await.unwrap().unwrap();
        let b1 = store.get_block("1_9_77_1_0", 0, 1024).await.unwrap().unwrap();
        assert_eq!(b0.len(), 1024);
        assert_eq!(b1.len(), 512);
        assert_eq!([b0, b1].concat(), data);
        assert_eq!(store.len().await, 2);
    }
}
