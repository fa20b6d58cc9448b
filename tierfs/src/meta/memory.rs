//! In-process metadata service.
//!
//! Keeps inodes in a map and serves chunk-info modifications with the same
//! rules the client applies locally (`ChunkIndexMap::apply`).

use super::{
    ChunkInfoRequest, Inode, InodeAttr, InodeParam, MetaClient, MetaError, MetaResult, Timestamp,
};
use crate::chuck::extent::ChunkIndexMap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

pub struct InMemoryMetaClient {
    inodes: Mutex<HashMap<(u32, u64), Inode>>,
    next_inode: AtomicU64,
    next_chunk_id: AtomicU64,
}

impl Default for InMemoryMetaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetaClient {
    pub fn new() -> Self {
        Self {
            inodes: Mutex::new(HashMap::new()),
            next_inode: AtomicU64::new(1),
            next_chunk_id: AtomicU64::new(1),
        }
    }

    /// Copy of the stored inode, if any.
    pub async fn snapshot(&self, fs_id: u32, inode_id: u64) -> Option<Inode> {
        self.inodes.lock().await.get(&(fs_id, inode_id)).cloned()
    }

    pub async fn inode_count(&self) -> usize {
        self.inodes.lock().await.len()
    }
}

fn not_found(fs_id: u32, inode_id: u64) -> MetaError {
    MetaError::NotFound(format!("inode {fs_id}/{inode_id}"))
}

#[async_trait]
impl MetaClient for InMemoryMetaClient {
    async fn get_inode(&self, fs_id: u32, inode_id: u64) -> MetaResult<Inode> {
        self.inodes
            .lock()
            .await
            .get(&(fs_id, inode_id))
            .cloned()
            .ok_or_else(|| not_found(fs_id, inode_id))
    }

    async fn create_inode(&self, param: InodeParam) -> MetaResult<Inode> {
        let inode_id = self.next_inode.fetch_add(1, Ordering::Relaxed);
        let now = Timestamp::now();
        let attr = InodeAttr {
            fs_id: param.fs_id,
            inode_id,
            kind: param.kind,
            length: param.symlink.as_ref().map_or(0, |s| s.len() as u64),
            uid: param.uid,
            gid: param.gid,
            mode: param.mode,
            nlink: 1,
            rdev: param.rdev,
            atime: now,
            mtime: now,
            ctime: now,
            open_flag: false,
            symlink: param.symlink,
        };
        let inode = Inode {
            attr,
            chunks: ChunkIndexMap::new(),
        };
        self.inodes
            .lock()
            .await
            .insert((param.fs_id, inode_id), inode.clone());
        debug!("created inode {}/{inode_id}", param.fs_id);
        Ok(inode)
    }

    async fn delete_inode(&self, fs_id: u32, inode_id: u64) -> MetaResult<()> {
        self.inodes
            .lock()
            .await
            .remove(&(fs_id, inode_id))
            .map(|_| ())
            .ok_or_else(|| not_found(fs_id, inode_id))
    }

    async fn update_inode(&self, attr: &InodeAttr) -> MetaResult<()> {
        let mut inodes = self.inodes.lock().await;
        let inode = inodes
            .get_mut(&(attr.fs_id, attr.inode_id))
            .ok_or_else(|| not_found(attr.fs_id, attr.inode_id))?;
        inode.attr = attr.clone();
        Ok(())
    }

    async fn get_or_modify_chunk_info(
        &self,
        req: ChunkInfoRequest,
    ) -> MetaResult<Option<ChunkIndexMap>> {
        let mut inodes = self.inodes.lock().await;
        let inode = inodes
            .get_mut(&(req.fs_id, req.inode_id))
            .ok_or_else(|| not_found(req.fs_id, req.inode_id))?;
        inode
            .chunks
            .apply(&req.add, &req.remove, req.from_compaction)
            .map_err(|e| MetaError::Param(e.to_string()))?;
        Ok(req.return_map.then(|| inode.chunks.clone()))
    }

    async fn allocate_chunk_id(&self, _fs_id: u32) -> MetaResult<u64> {
        Ok(self.next_chunk_id.fetch_add(1, Ordering::Relaxed))
    }
}
