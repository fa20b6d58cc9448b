//! 基于对象存储的数据路径：串联 inode 缓存、块存储（磁盘缓存 + 对象存储）与元数据服务。
//!
//! 写入：按 chunk 拆分 -> 分配 chunk_id -> 写块对象 -> 追加描述符 -> 更新长度 -> 交给刷新队列。
//! 读取：按 chunk 拆分 -> 取描述符列表 -> 逐 chunk 解析。

use super::cache::{FlushReport, InodeCache};
use super::inode::InodeRecord;
use crate::chuck::chunk::ChunkLayout;
use crate::chuck::reader::ChunkReader;
use crate::chuck::slice::ChunkDescriptor;
use crate::chuck::store::BlockStore;
use crate::chuck::util::{ChunkSpan, split_file_range_into_chunks};
use crate::chuck::writer::ChunkWriter;
use crate::error::Result;
use crate::meta::{InodeParam, Timestamp};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct ObjectDataPath<S: BlockStore> {
    layout: ChunkLayout,
    cache: Arc<InodeCache>,
    store: Arc<S>,
}

impl<S: BlockStore> ObjectDataPath<S> {
    pub fn new(layout: ChunkLayout, cache: Arc<InodeCache>, store: Arc<S>) -> Self {
        Self {
            layout,
            cache,
            store,
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn inode_cache(&self) -> &Arc<InodeCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// 创建普通文件，返回 inode 号。
    pub async fn create_file(&self, mode: u32) -> Result<u64> {
        let rec = self
            .cache
            .create(InodeParam::file(self.cache.fs_id(), mode))
            .await?;
        Ok(rec.inode_id())
    }

    async fn allocate_chunk_id(&self) -> Result<u64> {
        Ok(self.cache.meta().allocate_chunk_id(self.cache.fs_id()).await?)
    }

    /// 为 `[start, end)` 追加零描述符，覆盖截断后残留的旧数据。
    async fn zero_fill(&self, rec: &InodeRecord, start: u64, end: u64) -> Result<()> {
        for sp in split_file_range_into_chunks(self.layout, start, end - start) {
            let chunk_id = self.allocate_chunk_id().await?;
            let desc = ChunkDescriptor::zeroed(chunk_id, sp.file_offset, sp.len, end);
            rec.append_chunk_descriptor(sp.chunk_index, desc).await;
        }
        Ok(())
    }

    /// 写文件（按文件偏移），内部映射到多个 chunk 写入。
    pub async fn write(&self, inode_id: u64, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let rec = self.cache.get(inode_id).await?;
        let end = offset + data.len() as u64;
        let length = rec.length().await;
        if offset > length {
            self.zero_fill(&rec, length, offset).await?;
        }
        let file_size = length.max(end);

        let data = Bytes::copy_from_slice(data);
        let writer = ChunkWriter::new(self.layout, rec.fs_id(), inode_id, self.store.as_ref());
        let spans: Vec<ChunkSpan> = split_file_range_into_chunks(self.layout, offset, data.len() as u64);
        for sp in spans {
            let chunk_id = self.allocate_chunk_id().await?;
            let rel = (sp.file_offset - offset) as usize;
            let buf = data.slice(rel..rel + sp.len as usize);
            let desc = writer.write(chunk_id, sp.file_offset, buf, file_size).await?;
            // 块对象全部写入后才记录描述符
            rec.append_chunk_descriptor(sp.chunk_index, desc).await;
        }

        rec.mutate_attributes(|attr| {
            let now = Timestamp::now();
            attr.length = attr.length.max(end);
            attr.mtime = now;
            attr.ctime = now;
        })
        .await;
        self.cache.ship_to_flush(&rec).await;
        trace!("wrote {} bytes to inode {inode_id} at {offset}", data.len());
        Ok(data.len())
    }

    /// 读文件（按文件偏移），读到文件末尾为止。
    pub async fn read(&self, inode_id: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let rec = self.cache.get(inode_id).await?;
        let length = rec.length().await;
        if len == 0 || offset >= length {
            return Ok(Vec::new());
        }
        let len = (len as u64).min(length - offset);
        let reader = ChunkReader::new(self.layout, rec.fs_id(), inode_id, self.store.as_ref());
        let mut out = Vec::with_capacity(len as usize);
        for sp in split_file_range_into_chunks(self.layout, offset, len) {
            let descs = rec.chunk_list(sp.chunk_index).await;
            let part = reader.read(&descs, sp.file_offset, sp.len as usize).await?;
            out.extend(part);
        }
        Ok(out)
    }

    /// 截断/扩展文件。
    ///
    /// 缩小时丢弃新长度之后的整个 chunk；扩展时追加零描述符，避免读到旧数据。
    pub async fn truncate(&self, inode_id: u64, size: u64) -> Result<()> {
        let rec = self.cache.get(inode_id).await?;
        let length = rec.length().await;
        if size < length {
            let first = size.div_ceil(self.layout.chunk_size);
            let dropped = rec.drop_chunks_from(first).await;
            debug!(
                "truncate inode {inode_id} to {size}: dropped {} chunk indices",
                dropped.len()
            );
        } else if size > length {
            self.zero_fill(&rec, length, size).await?;
        }
        rec.set_length(size).await;
        self.cache.ship_to_flush(&rec).await;
        Ok(())
    }

    /// 将单个 inode 同步到元数据服务。
    pub async fn flush(&self, inode_id: u64) -> Result<()> {
        self.cache.get(inode_id).await?.sync().await
    }

    /// 先把磁盘写缓存全部上传，再刷新所有脏 inode。
    pub async fn fs_sync(&self) -> Result<FlushReport> {
        self.store.flush().await?;
        Ok(self.cache.flush_all().await)
    }
}
