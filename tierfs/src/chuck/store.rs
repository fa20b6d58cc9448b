//! 块存储抽象：按对象名读写块对象 + 内存实现 + 分层实现（磁盘缓存 + 对象存储）。

use super::disk_cache::{DiskCacheManager, DiskCacheType, ReadOutcome};
use crate::cadapter::client::{ObjectBackend, ObjectClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{Mutex, oneshot};
use tracing::{trace, warn};

/// 块对象存储接口。对象名由 `ChunkDescriptor::object_name` 生成。
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn put_block(&self, name: &str, data: Bytes) -> Result<()>;

    /// 读取 `[offset, offset + len)`，超出对象末尾的部分被截断；对象不存在返回 `None`。
    async fn get_block(&self, name: &str, offset: u64, len: usize) -> Result<Option<Vec<u8>>>;

    async fn delete_block(&self, name: &str) -> Result<()>;

    /// 将本地尚未持久化的数据推送到对象存储。
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn clip(buf: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = (offset as usize).min(buf.len());
    let end = start.saturating_add(len).min(buf.len());
    buf[start..end].to_vec()
}

/// 简单内存实现：用于本地开发/测试。
#[derive(Default)]
pub struct InMemoryBlockStore {
    map: Mutex<HashMap<String, Bytes>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.map.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.lock().await.is_empty()
    }
}

#[async_trait]
impl BlockStore for InMemoryBlockStore {
    async fn put_block(&self, name: &str, data: Bytes) -> Result<()> {
        self.map.lock().await.insert(name.to_string(), data);
        Ok(())
    }

    async fn get_block(&self, name: &str, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
        Ok(self
            .map
            .lock()
            .await
            .get(name)
            .map(|buf| clip(buf, offset, len)))
    }

    async fn delete_block(&self, name: &str) -> Result<()> {
        self.map.lock().await.remove(name);
        Ok(())
    }
}

/// 分层实现：磁盘缓存在前，对象存储在后。
///
/// - `ReadWrite`：写入落盘后异步上传；读取先查磁盘，未命中再读远端并回填读缓存。
/// - `OnlyRead`：写入直接上传；读取同上。
/// - `Disable`：读写都直接访问对象存储。
pub struct TieredBlockStore<B: ObjectBackend + 'static> {
    client: ObjectClient<B>,
    disk: Option<DiskCacheManager<B>>,
}

impl<B: ObjectBackend + 'static> TieredBlockStore<B> {
    /// 关闭 `Disable` 类型的磁盘缓存。
    pub fn new(client: ObjectClient<B>, disk: Option<DiskCacheManager<B>>) -> Self {
        let disk = disk.filter(|d| d.cache_type() != DiskCacheType::Disable);
        Self { client, disk }
    }

    pub fn client(&self) -> &ObjectClient<B> {
        &self.client
    }

    pub fn disk_cache(&self) -> Option<&DiskCacheManager<B>> {
        self.disk.as_ref()
    }

    fn write_cache(&self) -> Option<&DiskCacheManager<B>> {
        self.disk
            .as_ref()
            .filter(|d| d.cache_type() == DiskCacheType::ReadWrite)
    }

    /// 经由 inflight 限流的异步上传，等待完成回调。
    async fn put_remote(&self, name: &str, data: Bytes) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.client
            .put_object_async(name.to_string(), data, move |res| {
                let _ = tx.send(res);
            })
            .await;
        rx.await
            .map_err(|_| Error::Shutdown("object upload task dropped"))?
    }

    async fn get_remote(&self, name: &str, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        self.client
            .get_object_async(name.to_string(), offset, len, move |res| {
                let _ = tx.send(res);
            })
            .await;
        rx.await
            .map_err(|_| Error::Shutdown("object download task dropped"))?
    }
}

#[async_trait]
impl<B: ObjectBackend + 'static> BlockStore for TieredBlockStore<B> {
    async fn put_block(&self, name: &str, data: Bytes) -> Result<()> {
        if let Some(disk) = self.write_cache() {
            disk.write_through(name, &data).await?;
            return disk.async_upload(name).await;
        }
        self.put_remote(name, data).await
    }

    async fn get_block(&self, name: &str, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let Some(disk) = &self.disk else {
            return self.get_remote(name, offset, len).await;
        };
        if let ReadOutcome::Hit(buf) = disk.read_through(name, offset, len).await? {
            trace!("disk cache hit {name}");
            return Ok(Some(buf));
        }
        // 未命中：读取整个对象以便回填读缓存
        let Some(whole) = self.client.get_object(name).await? else {
            return Ok(None);
        };
        if let Err(e) = disk.write_read_direct(name, &whole).await {
            warn!("cache {name} after remote read failed: {e}");
        }
        Ok(Some(clip(&whole, offset, len)))
    }

    async fn delete_block(&self, name: &str) -> Result<()> {
        self.client.delete_object(name).await
    }

    async fn flush(&self) -> Result<()> {
        if let Some(disk) = self.write_cache() {
            disk.upload_all().await?;
        }
        Ok(())
    }
}
