//! Test double: an in-memory service that counts calls and fails on demand.

use super::{
    ChunkInfoRequest, InMemoryMetaClient, Inode, InodeAttr, InodeParam, MetaClient, MetaError,
    MetaResult,
};
use crate::chuck::extent::ChunkIndexMap;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub(crate) struct ScriptedMetaClient {
    pub inner: InMemoryMetaClient,
    pub get_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub chunk_calls: AtomicUsize,
    fail_updates: AtomicU32,
    fail_chunk_calls: AtomicU32,
    lose_chunk_replies: AtomicU32,
    /// Held by a test to park `update_inode` callers.
    pub update_gate: Mutex<()>,
}

impl ScriptedMetaClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `update_inode` calls fail with a remote error.
    pub fn fail_next_updates(&self, n: u32) {
        self.fail_updates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_chunk_calls(&self, n: u32) {
        self.fail_chunk_calls.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` chunk-info modifications, then fail them as if the
    /// reply got lost.
    pub fn lose_next_chunk_replies(&self, n: u32) {
        self.lose_chunk_replies.store(n, Ordering::SeqCst);
    }

    pub fn updates(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn chunk_modifications(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MetaClient for ScriptedMetaClient {
    async fn get_inode(&self, fs_id: u32, inode_id: u64) -> MetaResult<Inode> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_inode(fs_id, inode_id).await
    }

    async fn create_inode(&self, param: InodeParam) -> MetaResult<Inode> {
        self.inner.create_inode(param).await
    }

    async fn delete_inode(&self, fs_id: u32, inode_id: u64) -> MetaResult<()> {
        self.inner.delete_inode(fs_id, inode_id).await
    }

    async fn update_inode(&self, attr: &InodeAttr) -> MetaResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        drop(self.update_gate.lock().await);
        if Self::take_failure(&self.fail_updates) {
            return Err(MetaError::Remote("injected update failure".into()));
        }
        self.inner.update_inode(attr).await
    }

    async fn get_or_modify_chunk_info(
        &self,
        req: ChunkInfoRequest,
    ) -> MetaResult<Option<ChunkIndexMap>> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_chunk_calls) {
            return Err(MetaError::Remote("injected chunk info failure".into()));
        }
        let res = self.inner.get_or_modify_chunk_info(req).await;
        if res.is_ok() && Self::take_failure(&self.lose_chunk_replies) {
            return Err(MetaError::Remote("injected lost reply".into()));
        }
        res
    }

    async fn allocate_chunk_id(&self, fs_id: u32) -> MetaResult<u64> {
        self.inner.allocate_chunk_id(fs_id).await
    }
}
