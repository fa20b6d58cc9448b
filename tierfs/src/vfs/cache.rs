//! Bounded table of inode records plus the dirty-flush pipeline.
//!
//! Two indices share the same `Arc<InodeRecord>`s: an LRU table bounded by the
//! configured capacity, and the dirty set that feeds `flush_once`. A record
//! pushed out of the LRU table is flushed by a background task before it is
//! dropped; while that flush runs the record stays reachable through the
//! `evicting` index so a concurrent `get` picks it up instead of fetching a
//! stale copy.

use super::inode::InodeRecord;
use crate::error::Result;
use crate::meta::{InodeParam, MetaClient};
use futures::future::join_all;
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Pause between `flush_all` cycles that hit failures.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

struct Tables {
    lru: LruCache<u64, Arc<InodeRecord>>,
    dirty: BTreeMap<u64, Arc<InodeRecord>>,
    evicting: HashMap<u64, Arc<InodeRecord>>,
}

/// Outcome of one drain cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
    pub requeued: usize,
}

pub struct InodeCache {
    fs_id: u32,
    meta: Arc<dyn MetaClient>,
    tables: Arc<Mutex<Tables>>,
    evictions: Mutex<JoinSet<()>>,
}

impl InodeCache {
    pub fn new(fs_id: u32, capacity: usize, meta: Arc<dyn MetaClient>) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            fs_id,
            meta,
            tables: Arc::new(Mutex::new(Tables {
                lru: LruCache::new(cap),
                dirty: BTreeMap::new(),
                evicting: HashMap::new(),
            })),
            evictions: Mutex::new(JoinSet::new()),
        }
    }

    pub fn fs_id(&self) -> u32 {
        self.fs_id
    }

    pub fn meta(&self) -> &Arc<dyn MetaClient> {
        &self.meta
    }

    /// Resident record for `inode_id`, fetching it from the service on a miss.
    pub async fn get(&self, inode_id: u64) -> Result<Arc<InodeRecord>> {
        {
            let mut t = self.tables.lock().await;
            if let Some(rec) = t.lru.get(&inode_id) {
                return Ok(rec.clone());
            }
            // not resident but still owned by the flush pipeline
            let parked = t
                .dirty
                .get(&inode_id)
                .or_else(|| t.evicting.get(&inode_id))
                .cloned();
            if let Some(rec) = parked {
                let evicted = t.lru.push(inode_id, rec.clone());
                self.on_evicted(&mut t, evicted).await;
                return Ok(rec);
            }
        }

        let inode = self.meta.get_inode(self.fs_id, inode_id).await?;
        let rec = Arc::new(InodeRecord::new(inode, self.meta.clone()));
        Ok(self.insert(rec).await)
    }

    pub async fn create(&self, param: InodeParam) -> Result<Arc<InodeRecord>> {
        let inode = self.meta.create_inode(param).await?;
        debug!("created inode {}", inode.attr.inode_id);
        let rec = Arc::new(InodeRecord::new(inode, self.meta.clone()));
        Ok(self.insert(rec).await)
    }

    /// Drop the record from both indices and delete it on the service.
    /// An inode already gone on the service counts as deleted.
    pub async fn delete(&self, inode_id: u64) -> Result<()> {
        self.clear(inode_id).await;
        match self.meta.delete_inode(self.fs_id, inode_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = crate::error::Error::from(e);
                if e.is_not_found() {
                    debug!("inode {inode_id} already deleted");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Forget a record locally without telling the service.
    pub async fn clear(&self, inode_id: u64) {
        let mut t = self.tables.lock().await;
        t.lru.pop(&inode_id);
        t.dirty.remove(&inode_id);
        // an eviction flush still running no longer owns it
        t.evicting.remove(&inode_id);
    }

    /// Queue a record for the next flush cycle. Re-queuing is a no-op.
    pub async fn ship_to_flush(&self, rec: &Arc<InodeRecord>) {
        self.tables
            .lock()
            .await
            .dirty
            .entry(rec.inode_id())
            .or_insert_with(|| rec.clone());
    }

    pub async fn len(&self) -> usize {
        self.tables.lock().await.lru.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dirty_len(&self) -> usize {
        self.tables.lock().await.dirty.len()
    }

    /// One drain cycle: take the dirty set, flush every record in it outside
    /// the lock, put failed records back.
    pub async fn flush_once(&self) -> FlushReport {
        self.reap_evictions().await;
        let batch = std::mem::take(&mut self.tables.lock().await.dirty);
        if batch.is_empty() {
            return FlushReport::default();
        }

        let results = join_all(batch.into_values().map(|rec| async move {
            let res = rec.sync().await;
            (rec, res)
        }))
        .await;

        let mut report = FlushReport::default();
        let mut retry = Vec::new();
        for (rec, res) in results {
            match res {
                Ok(()) => report.flushed += 1,
                Err(e) if e.is_not_found() => {
                    warn!("inode {} vanished during flush: {e}", rec.inode_id());
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("flush inode {} failed: {e}", rec.inode_id());
                    report.failed += 1;
                    retry.push(rec);
                }
            }
        }
        if !retry.is_empty() {
            report.requeued = retry.len();
            let mut t = self.tables.lock().await;
            for rec in retry {
                t.dirty.entry(rec.inode_id()).or_insert(rec);
            }
        }
        debug!(
            "flush cycle: {} flushed, {} failed, {} requeued",
            report.flushed, report.failed, report.requeued
        );
        report
    }

    /// Drain until the dirty set stays empty, retrying failed records.
    pub async fn flush_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        loop {
            self.wait_evictions().await;
            let report = self.flush_once().await;
            total.flushed += report.flushed;
            total.failed += report.failed;
            total.requeued += report.requeued;

            if self.dirty_len().await == 0 && self.evictions.lock().await.is_empty() {
                break;
            }
            if report.failed > 0 {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
        info!("flush all done, {} records flushed", total.flushed);
        total
    }

    /// Wait for every background eviction flush started so far.
    pub async fn wait_evictions(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.evictions.lock().await);
            if set.is_empty() {
                return;
            }
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    warn!("eviction flush task failed: {e}");
                }
            }
        }
    }

    /// Collect eviction flushes that already finished, without waiting.
    async fn reap_evictions(&self) {
        reap_finished(&mut *self.evictions.lock().await);
    }

    /// Eviction flushes spawned and not yet collected.
    #[cfg(test)]
    pub(crate) async fn pending_evictions(&self) -> usize {
        self.evictions.lock().await.len()
    }

    async fn insert(&self, rec: Arc<InodeRecord>) -> Arc<InodeRecord> {
        let id = rec.inode_id();
        let mut t = self.tables.lock().await;
        // raced with another fetch of the same inode
        if let Some(existing) = t.lru.get(&id) {
            return existing.clone();
        }
        let evicted = t.lru.push(id, rec.clone());
        self.on_evicted(&mut t, evicted).await;
        rec
    }

    /// Hand an LRU victim to a background flush.
    async fn on_evicted(&self, t: &mut Tables, evicted: Option<(u64, Arc<InodeRecord>)>) {
        let Some((id, victim)) = evicted else {
            return;
        };
        t.dirty.remove(&id);
        t.evicting.insert(id, victim.clone());

        let tables = self.tables.clone();
        let mut set = self.evictions.lock().await;
        reap_finished(&mut set);
        set.spawn(async move {
            let res = victim.sync().await;
            let mut t = tables.lock().await;
            // cleared (deleted) while the flush ran
            let owned = t
                .evicting
                .get(&id)
                .is_some_and(|r| Arc::ptr_eq(r, &victim));
            if owned {
                t.evicting.remove(&id);
            }
            match res {
                Ok(()) => debug!("evicted inode {id} flushed"),
                Err(e) if e.is_not_found() => warn!("evicted inode {id} is gone: {e}"),
                Err(e) if owned => {
                    warn!("flush evicted inode {id} failed, requeue: {e}");
                    t.dirty.entry(id).or_insert(victim);
                }
                Err(e) => debug!("flush evicted inode {id} failed after it was dropped: {e}"),
            }
        });
    }
}

fn reap_finished(set: &mut JoinSet<()>) {
    while let Some(res) = set.try_join_next() {
        if let Err(e) = res {
            warn!("eviction flush task failed: {e}");
        }
    }
}
