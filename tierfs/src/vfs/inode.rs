//! In-memory state of one inode and its sync to the metadata service.
//!
//! A record owns three independent locks:
//!
//! - `state`: attributes, chunk map and pending deltas; held only for in-memory
//!   edits, never across a remote call.
//! - `attr_sync`: serializes attribute syncs of this record.
//! - `chunk_sync`: serializes chunk-info syncs of this record.
//!
//! An attribute sync and a chunk-info sync of the same record may therefore run
//! at the same time, while writers keep appending descriptors under `state`.

use crate::chuck::extent::ChunkIndexMap;
use crate::chuck::slice::ChunkDescriptor;
use crate::error::{Error, Result};
use crate::meta::{ChunkInfoRequest, FileType, Inode, InodeAttr, MetaClient, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Block size hint reported by `stat`.
pub const STAT_BLKSIZE: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeStatus {
    Normal,
    /// The service reported the inode gone; syncs are expected to keep failing.
    Error,
}

/// POSIX-style attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

struct InodeState {
    attr: InodeAttr,
    chunks: ChunkIndexMap,
    /// Bumped by every attribute mutation.
    attr_version: u64,
    /// Highest version known to be on the service.
    synced_version: u64,
    pending_add: ChunkIndexMap,
    /// Addition batch sent but not acknowledged. It may have landed, so it is
    /// resent unchanged before anything appended later.
    inflight_add: Option<ChunkIndexMap>,
    pending_remove: ChunkIndexMap,
    pending_compactions: VecDeque<(ChunkIndexMap, ChunkIndexMap)>,
    open_count: u32,
    status: InodeStatus,
}

impl InodeState {
    fn touch(&mut self) {
        self.attr_version += 1;
    }

    fn attr_dirty(&self) -> bool {
        self.attr_version != self.synced_version
    }

    fn chunks_dirty(&self) -> bool {
        !self.pending_add.is_empty()
            || self.inflight_add.is_some()
            || !self.pending_remove.is_empty()
            || !self.pending_compactions.is_empty()
    }

    /// Withdraw queued compactions of the chunk indices `touched` selects.
    ///
    /// The descriptors a withdrawn compaction replaced are queued for removal
    /// instead, so the service converges on the local map whether or not the
    /// compaction already landed. Emptied batches stay queued and are skipped.
    fn withdraw_compactions(&mut self, touched: impl Fn(u64, &[ChunkDescriptor]) -> bool) {
        let mut replaced = Vec::new();
        for (add, remove) in &mut self.pending_compactions {
            let hit: Vec<u64> = add
                .iter()
                .filter(|(index, list)| touched(*index, *list))
                .map(|(index, _)| index)
                .collect();
            for index in hit {
                add.remove_index(index);
                if let Some(orig) = remove.remove_index(index) {
                    replaced.push((index, orig));
                }
            }
        }
        if !replaced.is_empty() {
            self.pending_remove.extend(&ChunkIndexMap::from_lists(replaced));
        }
    }
}

pub struct InodeRecord {
    fs_id: u32,
    inode_id: u64,
    meta: Arc<dyn MetaClient>,
    state: Mutex<InodeState>,
    attr_sync: Mutex<()>,
    chunk_sync: Mutex<()>,
}

impl std::fmt::Debug for InodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeRecord")
            .field("fs_id", &self.fs_id)
            .field("inode_id", &self.inode_id)
            .finish_non_exhaustive()
    }
}

impl InodeRecord {
    pub fn new(inode: Inode, meta: Arc<dyn MetaClient>) -> Self {
        Self {
            fs_id: inode.attr.fs_id,
            inode_id: inode.attr.inode_id,
            meta,
            state: Mutex::new(InodeState {
                attr: inode.attr,
                chunks: inode.chunks,
                attr_version: 0,
                synced_version: 0,
                pending_add: ChunkIndexMap::new(),
                inflight_add: None,
                pending_remove: ChunkIndexMap::new(),
                pending_compactions: VecDeque::new(),
                open_count: 0,
                status: InodeStatus::Normal,
            }),
            attr_sync: Mutex::new(()),
            chunk_sync: Mutex::new(()),
        }
    }

    pub fn fs_id(&self) -> u32 {
        self.fs_id
    }

    pub fn inode_id(&self) -> u64 {
        self.inode_id
    }

    pub async fn attr(&self) -> InodeAttr {
        self.state.lock().await.attr.clone()
    }

    pub async fn length(&self) -> u64 {
        self.state.lock().await.attr.length
    }

    pub async fn status(&self) -> InodeStatus {
        self.state.lock().await.status
    }

    pub async fn is_dirty(&self) -> bool {
        let s = self.state.lock().await;
        s.attr_dirty() || s.chunks_dirty()
    }

    pub async fn open_count(&self) -> u32 {
        self.state.lock().await.open_count
    }

    /// Copy of the whole chunk map.
    pub async fn chunk_map(&self) -> ChunkIndexMap {
        self.state.lock().await.chunks.clone()
    }

    /// Descriptors of one chunk index, ascending by `chunk_id`.
    pub async fn chunk_list(&self, chunk_index: u64) -> Vec<ChunkDescriptor> {
        self.state
            .lock()
            .await
            .chunks
            .get(chunk_index)
            .map(<[_]>::to_vec)
            .unwrap_or_default()
    }

    /// Apply `f` to the attributes and mark them dirty.
    pub async fn mutate_attributes<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut InodeAttr) -> R,
    {
        let mut s = self.state.lock().await;
        let r = f(&mut s.attr);
        s.touch();
        r
    }

    pub async fn set_length(&self, length: u64) {
        self.mutate_attributes(|attr| {
            let now = Timestamp::now();
            attr.length = length;
            attr.mtime = now;
            attr.ctime = now;
        })
        .await
    }

    pub async fn set_mode(&self, mode: u32) {
        self.mutate_attributes(|attr| {
            attr.mode = mode;
            attr.ctime = Timestamp::now();
        })
        .await
    }

    pub async fn set_owner(&self, uid: u32, gid: u32) {
        self.mutate_attributes(|attr| {
            attr.uid = uid;
            attr.gid = gid;
            attr.ctime = Timestamp::now();
        })
        .await
    }

    pub async fn set_times(&self, atime: Option<Timestamp>, mtime: Option<Timestamp>) {
        self.mutate_attributes(|attr| {
            if let Some(t) = atime {
                attr.atime = t;
            }
            if let Some(t) = mtime {
                attr.mtime = t;
            }
            attr.ctime = Timestamp::now();
        })
        .await
    }

    /// Record a new descriptor locally and queue it for the service.
    pub async fn append_chunk_descriptor(&self, chunk_index: u64, desc: ChunkDescriptor) {
        let mut s = self.state.lock().await;
        s.chunks.append(chunk_index, desc);
        s.pending_add.append(chunk_index, desc);
    }

    /// Remove descriptors locally and queue the removal.
    pub async fn remove_chunk_descriptors(&self, remove: &ChunkIndexMap) {
        let mut s = self.state.lock().await;
        s.chunks.remove(remove);
        s.pending_add.remove(remove);
        s.pending_remove.extend(remove);
        // a compacted descriptor removed before its compaction was sent
        s.withdraw_compactions(|index, added| {
            remove
                .get(index)
                .is_some_and(|gone| added.iter().any(|d| gone.contains(d)))
        });
    }

    /// Drop every chunk index `>= first_index` and queue the removal.
    pub async fn drop_chunks_from(&self, first_index: u64) -> ChunkIndexMap {
        let mut s = self.state.lock().await;
        let dropped = s.chunks.split_off(first_index);
        s.pending_add.split_off(first_index);
        s.pending_remove.extend(&dropped);
        s.withdraw_compactions(|index, _| index >= first_index);
        dropped
    }

    /// Compact locally and queue the batch, to be sent with the compaction flag.
    pub async fn compact_chunk(&self, add: ChunkIndexMap, remove: ChunkIndexMap) -> Result<()> {
        let mut s = self.state.lock().await;
        s.chunks.compact(&add, &remove)?;
        s.pending_compactions.push_back((add, remove));
        Ok(())
    }

    /// Push the attribute snapshot to the service.
    ///
    /// The dirty state clears only if nothing mutated the attributes while the
    /// call was in flight.
    pub async fn sync_attributes(&self) -> Result<()> {
        let _guard = self.attr_sync.lock().await;
        let (attr, version) = {
            let s = self.state.lock().await;
            if !s.attr_dirty() {
                return Ok(());
            }
            (s.attr.clone(), s.attr_version)
        };

        match self.meta.update_inode(&attr).await {
            Ok(()) => {
                let mut s = self.state.lock().await;
                s.synced_version = s.synced_version.max(version);
                trace!("inode {} attributes synced at version {version}", self.inode_id);
                Ok(())
            }
            Err(e) => {
                let e = Error::from(e);
                self.note_failure(&e, "attributes").await;
                Err(e)
            }
        }
    }

    /// Send pending additions, removals and compactions to the service.
    pub async fn sync_chunk_info(&self) -> Result<()> {
        let _guard = self.chunk_sync.lock().await;
        self.push_chunk_info().await
    }

    /// Attributes first; chunk info only once the attributes are on the service.
    pub async fn sync(&self) -> Result<()> {
        self.sync_attributes().await?;
        self.sync_chunk_info().await
    }

    /// Push pending edits, then replace the local chunk map with the service's.
    pub async fn refresh_chunk_info(&self) -> Result<()> {
        let _guard = self.chunk_sync.lock().await;
        self.push_chunk_info().await?;

        let req = ChunkInfoRequest {
            fs_id: self.fs_id,
            inode_id: self.inode_id,
            add: ChunkIndexMap::new(),
            remove: ChunkIndexMap::new(),
            return_map: true,
            from_compaction: false,
        };
        match self.meta.get_or_modify_chunk_info(req).await {
            Ok(map) => {
                let mut s = self.state.lock().await;
                let mut fresh = map.unwrap_or_default();
                // edits queued while the request was in flight, in send order
                fresh.extend(&s.pending_add);
                fresh.remove(&s.pending_remove);
                for (add, remove) in &s.pending_compactions {
                    if let Err(e) = fresh.compact(add, remove) {
                        warn!("inode {} replay compaction on refresh: {e}", self.inode_id);
                    }
                }
                s.chunks = fresh;
                debug!(
                    "inode {} chunk info refreshed, {} indices",
                    self.inode_id,
                    s.chunks.len()
                );
                Ok(())
            }
            Err(e) => {
                let e = Error::from(e);
                self.note_failure(&e, "chunk info refresh").await;
                Err(e)
            }
        }
    }

    /// Take an open handle; the first one publishes the open flag.
    pub async fn open(&self) -> Result<()> {
        let publish = {
            let mut s = self.state.lock().await;
            s.open_count += 1;
            if s.open_count == 1 && !s.attr.open_flag {
                s.attr.open_flag = true;
                s.touch();
                true
            } else {
                false
            }
        };
        if publish {
            if let Err(e) = self.sync_attributes().await {
                let mut s = self.state.lock().await;
                s.open_count -= 1;
                if s.open_count == 0 {
                    s.attr.open_flag = false;
                    s.touch();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop an open handle; the last one clears the open flag.
    pub async fn release(&self) -> Result<()> {
        let publish = {
            let mut s = self.state.lock().await;
            match s.open_count {
                0 => return Ok(()),
                1 => {
                    s.open_count = 0;
                    s.attr.open_flag = false;
                    s.touch();
                    true
                }
                _ => {
                    s.open_count -= 1;
                    false
                }
            }
        };
        if publish {
            if let Err(e) = self.sync_attributes().await {
                let mut s = self.state.lock().await;
                s.open_count += 1;
                if s.open_count == 1 {
                    s.attr.open_flag = true;
                    s.touch();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn link(&self) -> Result<()> {
        self.mutate_attributes(|attr| {
            attr.nlink += 1;
            attr.ctime = Timestamp::now();
        })
        .await;
        self.sync_attributes().await
    }

    pub async fn unlink(&self) -> Result<()> {
        self.mutate_attributes(|attr| {
            attr.nlink = attr.nlink.saturating_sub(1);
            attr.ctime = Timestamp::now();
        })
        .await;
        self.sync_attributes().await
    }

    pub async fn stat(&self) -> FileStat {
        let attr = self.attr().await;
        let type_bits = match attr.kind {
            FileType::File => S_IFREG,
            FileType::Dir => S_IFDIR,
            FileType::Symlink => S_IFLNK,
        };
        let blocks = match attr.kind {
            FileType::File | FileType::Symlink => attr.length.div_ceil(512),
            FileType::Dir => 0,
        };
        FileStat {
            ino: attr.inode_id,
            mode: type_bits | (attr.mode & 0o7777),
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            size: attr.length,
            blocks,
            blksize: STAT_BLKSIZE,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
        }
    }

    /// Caller holds `chunk_sync`.
    async fn push_chunk_info(&self) -> Result<()> {
        // an unacknowledged batch first, then at most one fresh batch
        loop {
            let (add, resend) = {
                let mut s = self.state.lock().await;
                if let Some(batch) = s.inflight_add.clone() {
                    (batch, true)
                } else if s.pending_add.is_empty() {
                    break;
                } else {
                    let batch = s.pending_add.take();
                    s.inflight_add = Some(batch.clone());
                    (batch, false)
                }
            };
            if let Err(e) = self.modify_chunk_info(add, ChunkIndexMap::new(), false).await {
                self.note_failure(&e, "chunk info").await;
                return Err(e);
            }
            self.state.lock().await.inflight_add = None;
            if !resend {
                break;
            }
        }

        // Removals go in their own request: an already-applied `add` would make
        // the service skip the whole request.
        let remove = self.state.lock().await.pending_remove.take();
        if !remove.is_empty() {
            if let Err(e) = self.modify_chunk_info(ChunkIndexMap::new(), remove.clone(), false).await
            {
                self.state.lock().await.pending_remove.prepend(remove);
                self.note_failure(&e, "chunk info").await;
                return Err(e);
            }
        }

        loop {
            let next = self.state.lock().await.pending_compactions.front().cloned();
            let Some((add, remove)) = next else {
                break;
            };
            // withdrawn batches are popped without a request
            if !add.is_empty() || !remove.is_empty() {
                if let Err(e) = self.modify_chunk_info(add, remove, true).await {
                    self.note_failure(&e, "compaction").await;
                    return Err(e);
                }
            }
            self.state.lock().await.pending_compactions.pop_front();
        }
        Ok(())
    }

    async fn modify_chunk_info(
        &self,
        add: ChunkIndexMap,
        remove: ChunkIndexMap,
        from_compaction: bool,
    ) -> Result<()> {
        let req = ChunkInfoRequest {
            fs_id: self.fs_id,
            inode_id: self.inode_id,
            add,
            remove,
            return_map: false,
            from_compaction,
        };
        self.meta.get_or_modify_chunk_info(req).await?;
        Ok(())
    }

    async fn note_failure(&self, e: &Error, what: &str) {
        if e.is_not_found() {
            self.state.lock().await.status = InodeStatus::Error;
        }
        warn!("inode {} sync {what} failed: {e}", self.inode_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::InodeParam;
    use crate::meta::scripted::ScriptedMetaClient;

    async fn record() -> (Arc<ScriptedMetaClient>, InodeRecord) {
        let meta = Arc::new(ScriptedMetaClient::new());
        let inode = meta.create_inode(InodeParam::file(1, 0o644)).await.unwrap();
        let rec = InodeRecord::new(inode, meta.clone());
        (meta, rec)
    }

    #[tokio::test]
    async fn test_mutation_marks_dirty_and_sync_clears() {
        let (meta, rec) = record().await;
        assert!(!rec.is_dirty().await);
        rec.set_length(100).await;
        assert!(rec.is_dirty().await);

        rec.sync().await.unwrap();
        assert!(!rec.is_dirty().await);
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(stored.attr.length, 100);

        // clean sync is free
        rec.sync().await.unwrap();
        assert_eq!(meta.updates(), 1);
    }

    #[tokio::test]
    async fn test_descriptors_reach_service() {
        let (meta, rec) = record().await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(1, 0, 10, 10)).await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(2, 5, 10, 15)).await;
        rec.set_length(15).await;
        rec.sync().await.unwrap();

        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(stored.chunks, rec.chunk_map().await);
        assert_eq!(stored.chunks.descriptor_count(), 2);
        assert!(!rec.is_dirty().await);
    }

    #[tokio::test]
    async fn test_failed_chunk_sync_keeps_pending_in_order() {
        let (meta, rec) = record().await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(1, 0, 10, 10)).await;
        meta.fail_next_chunk_calls(1);
        assert!(rec.sync_chunk_info().await.is_err());
        assert!(rec.is_dirty().await);

        rec.append_chunk_descriptor(0, ChunkDescriptor::new(2, 0, 10, 10)).await;
        rec.sync_chunk_info().await.unwrap();
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        let ids: Vec<u64> = stored.chunks.get(0).unwrap().iter().map(|d| d.chunk_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    fn chunk_ids(map: &ChunkIndexMap, index: u64) -> Vec<u64> {
        map.get(index)
            .map(|l| l.iter().map(|d| d.chunk_id).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_lost_reply_does_not_swallow_later_additions() {
        let (meta, rec) = record().await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(1, 0, 10, 10)).await;
        meta.lose_next_chunk_replies(1);
        assert!(rec.sync_chunk_info().await.is_err());
        // landed even though the call failed
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(chunk_ids(&stored.chunks, 0), vec![1]);
        assert!(rec.is_dirty().await);

        rec.append_chunk_descriptor(0, ChunkDescriptor::new(2, 0, 10, 10)).await;
        rec.sync_chunk_info().await.unwrap();
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(chunk_ids(&stored.chunks, 0), vec![1, 2]);
        assert_eq!(stored.chunks, rec.chunk_map().await);
        assert!(!rec.is_dirty().await);
    }

    #[tokio::test]
    async fn test_refresh_after_lost_reply_keeps_later_additions() {
        let (meta, rec) = record().await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(1, 0, 10, 10)).await;
        meta.lose_next_chunk_replies(1);
        assert!(rec.refresh_chunk_info().await.is_err());

        rec.append_chunk_descriptor(0, ChunkDescriptor::new(2, 0, 10, 10)).await;
        rec.refresh_chunk_info().await.unwrap();
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(chunk_ids(&stored.chunks, 0), vec![1, 2]);
        assert_eq!(chunk_ids(&rec.chunk_map().await, 0), vec![1, 2]);
        assert!(!rec.is_dirty().await);
    }

    fn compaction_of(
        index: u64,
        ids: std::ops::Range<u64>,
        into: u64,
    ) -> (ChunkIndexMap, ChunkIndexMap) {
        let mut new = ChunkDescriptor::new(into, 0, 10, 10);
        new.compaction = 1;
        let add = ChunkIndexMap::from_lists([(index, vec![new])]);
        let remove = ChunkIndexMap::from_lists([(
            index,
            ids.map(|id| ChunkDescriptor::new(id, 0, 10, 10)).collect(),
        )]);
        (add, remove)
    }

    #[tokio::test]
    async fn test_truncate_after_compaction_leaves_no_index() {
        let (meta, rec) = record().await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(10, 0, 10, 10)).await;
        for id in 0..4 {
            rec.append_chunk_descriptor(1, ChunkDescriptor::new(id, 0, 10, 10)).await;
        }
        rec.sync_chunk_info().await.unwrap();

        let (add, remove) = compaction_of(1, 0..3, 2);
        rec.compact_chunk(add, remove).await.unwrap();
        let dropped = rec.drop_chunks_from(1).await;
        assert_eq!(chunk_ids(&dropped, 1), vec![2, 3]);
        rec.sync_chunk_info().await.unwrap();

        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert!(!stored.chunks.contains_index(1));
        assert_eq!(stored.chunks, rec.chunk_map().await);
        assert!(!rec.is_dirty().await);
    }

    #[tokio::test]
    async fn test_removing_compacted_descriptor_before_sync() {
        let (meta, rec) = record().await;
        for id in 0..4 {
            rec.append_chunk_descriptor(0, ChunkDescriptor::new(id, 0, 10, 10)).await;
        }
        let (add, remove) = compaction_of(0, 0..3, 2);
        rec.compact_chunk(add.clone(), remove).await.unwrap();
        rec.remove_chunk_descriptors(&add).await;
        assert_eq!(chunk_ids(&rec.chunk_map().await, 0), vec![3]);

        rec.sync_chunk_info().await.unwrap();
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(stored.chunks, rec.chunk_map().await);
        assert!(!rec.is_dirty().await);
    }

    #[tokio::test]
    async fn test_attribute_failure_blocks_chunk_sync() {
        let (meta, rec) = record().await;
        rec.set_length(10).await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(1, 0, 10, 10)).await;
        meta.fail_next_updates(1);
        assert!(rec.sync().await.is_err());
        assert_eq!(meta.chunk_modifications(), 0);

        rec.sync().await.unwrap();
        assert_eq!(meta.chunk_modifications(), 1);
    }

    #[tokio::test]
    async fn test_not_found_marks_error_status() {
        let (meta, rec) = record().await;
        meta.inner.delete_inode(1, rec.inode_id()).await.unwrap();
        rec.set_mode(0o600).await;
        let err = rec.sync().await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(rec.status().await, InodeStatus::Error);
        // still accepts mutations
        rec.set_mode(0o644).await;
        assert!(rec.is_dirty().await);
    }

    #[tokio::test]
    async fn test_mutation_during_sync_stays_dirty() {
        let (meta, rec) = record().await;
        rec.set_length(1).await;
        let in_flight = rec.state.lock().await.attr_version;
        rec.set_length(2).await;
        // completion of the older snapshot
        {
            let mut s = rec.state.lock().await;
            s.synced_version = s.synced_version.max(in_flight);
        }
        assert!(rec.is_dirty().await);

        rec.sync_attributes().await.unwrap();
        assert!(!rec.is_dirty().await);
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(stored.attr.length, 2);
    }

    #[tokio::test]
    async fn test_open_release_publish_flag() {
        let (meta, rec) = record().await;
        rec.open().await.unwrap();
        rec.open().await.unwrap();
        assert_eq!(rec.open_count().await, 2);
        assert!(meta.inner.snapshot(1, rec.inode_id()).await.unwrap().attr.open_flag);

        rec.release().await.unwrap();
        assert!(meta.inner.snapshot(1, rec.inode_id()).await.unwrap().attr.open_flag);
        rec.release().await.unwrap();
        assert!(!meta.inner.snapshot(1, rec.inode_id()).await.unwrap().attr.open_flag);
        assert_eq!(meta.updates(), 2);

        // release without open is a no-op
        rec.release().await.unwrap();
        assert_eq!(rec.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_open_failure_rolls_back() {
        let (meta, rec) = record().await;
        meta.fail_next_updates(1);
        assert!(rec.open().await.is_err());
        assert_eq!(rec.open_count().await, 0);
        assert!(!rec.attr().await.open_flag);
    }

    #[tokio::test]
    async fn test_link_unlink() {
        let (meta, rec) = record().await;
        rec.link().await.unwrap();
        assert_eq!(meta.inner.snapshot(1, rec.inode_id()).await.unwrap().attr.nlink, 2);
        rec.unlink().await.unwrap();
        rec.unlink().await.unwrap();
        rec.unlink().await.unwrap();
        assert_eq!(rec.attr().await.nlink, 0);
    }

    #[tokio::test]
    async fn test_compaction_is_sent_flagged() {
        let (meta, rec) = record().await;
        for id in 0..4 {
            rec.append_chunk_descriptor(0, ChunkDescriptor::new(id, 0, 10, 10)).await;
        }
        rec.sync_chunk_info().await.unwrap();

        let mut new = ChunkDescriptor::new(2, 0, 10, 10);
        new.compaction = 1;
        let add = ChunkIndexMap::from_lists([(0, vec![new])]);
        let remove = ChunkIndexMap::from_lists([(
            0,
            (0..3).map(|id| ChunkDescriptor::new(id, 0, 10, 10)).collect(),
        )]);
        rec.compact_chunk(add, remove).await.unwrap();
        rec.sync_chunk_info().await.unwrap();

        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(stored.chunks, rec.chunk_map().await);
        let ids: Vec<u64> = stored.chunks.get(0).unwrap().iter().map(|d| d.chunk_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_bad_compaction_rejected_locally() {
        let (_meta, rec) = record().await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(1, 0, 10, 10)).await;
        let before = rec.chunk_map().await;
        let add = ChunkIndexMap::from_lists([(0, vec![ChunkDescriptor::new(9, 0, 1, 1)])]);
        assert!(matches!(
            rec.compact_chunk(add, ChunkIndexMap::new()).await,
            Err(Error::Param(_))
        ));
        assert_eq!(rec.chunk_map().await, before);
    }

    #[tokio::test]
    async fn test_refresh_and_drop_chunks() {
        let (meta, rec) = record().await;
        rec.append_chunk_descriptor(0, ChunkDescriptor::new(1, 0, 10, 10)).await;
        rec.append_chunk_descriptor(3, ChunkDescriptor::new(2, 0, 10, 10)).await;
        rec.refresh_chunk_info().await.unwrap();
        assert_eq!(rec.chunk_map().await.len(), 2);

        let dropped = rec.drop_chunks_from(1).await;
        assert_eq!(dropped.len(), 1);
        rec.sync_chunk_info().await.unwrap();
        let stored = meta.inner.snapshot(1, rec.inode_id()).await.unwrap();
        assert_eq!(stored.chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_stat() {
        let (_meta, rec) = record().await;
        rec.set_length(1025).await;
        let st = rec.stat().await;
        assert_eq!(st.blocks, 3);
        assert_eq!(st.blksize, STAT_BLKSIZE);
        assert_eq!(st.mode, S_IFREG | 0o644);
        assert_eq!(st.size, 1025);
    }
}
