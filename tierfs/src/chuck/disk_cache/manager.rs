//! Disk cache manager: ties both areas to the object store.
//!
//! Owns the used-bytes counter, the set of cached names, the upload queues and
//! the trim loop. The counter tracks physical bytes once across both areas: it
//! grows on confirmed writes and shrinks only when a file's last link is
//! removed.

use super::policy::{EvictionPolicy, LruEviction};
use super::read::DiskCacheRead;
use super::write::DiskCacheWrite;
use super::DiskCacheType;
use crate::cadapter::client::{ObjectBackend, ObjectClient};
use crate::cadapter::throttle::{IoKind, ReadWriteThrottle};
use crate::config::DiskCacheConfig;
use crate::error::{Error, Result};
use futures::future::join_all;
use rand::Rng;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Result of a local read. A miss is not an error: the caller reads remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Hit(Vec<u8>),
    Miss,
}

struct Inner<B: ObjectBackend + 'static> {
    cfg: DiskCacheConfig,
    write: DiskCacheWrite,
    read: DiskCacheRead,
    client: ObjectClient<B>,
    used_bytes: AtomicU64,
    cached: Mutex<HashSet<String>>,
    policy: Mutex<Box<dyn EvictionPolicy>>,
    throttle: ReadWriteThrottle,
    queues: Vec<mpsc::Sender<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

pub struct DiskCacheManager<B: ObjectBackend + 'static> {
    inner: Arc<Inner<B>>,
}

impl<B: ObjectBackend + 'static> Clone for DiskCacheManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: ObjectBackend + 'static> DiskCacheManager<B> {
    /// Create the areas, load what is on disk, start upload workers and the
    /// trim loop, and queue leftover write files for upload.
    pub async fn init(cfg: DiskCacheConfig, client: ObjectClient<B>) -> Result<Self> {
        Self::with_policy(cfg, client, Box::new(LruEviction::new())).await
    }

    pub async fn with_policy(
        cfg: DiskCacheConfig,
        client: ObjectClient<B>,
        policy: Box<dyn EvictionPolicy>,
    ) -> Result<Self> {
        if cfg.upload_queue_num == 0 {
            return Err(Error::Config("disk cache needs at least one upload queue".into()));
        }
        let write = DiskCacheWrite::new(&cfg.cache_dir);
        let read = DiskCacheRead::new(&cfg.cache_dir);
        write.init().await?;
        read.init().await?;

        let mut receivers = Vec::with_capacity(cfg.upload_queue_num);
        let mut queues = Vec::with_capacity(cfg.upload_queue_num);
        for _ in 0..cfg.upload_queue_num {
            let (tx, rx) = mpsc::channel(cfg.upload_queue_depth.max(1));
            queues.push(tx);
            receivers.push(rx);
        }

        let mgr = Self {
            inner: Arc::new(Inner {
                throttle: ReadWriteThrottle::new(cfg.throttle),
                cfg,
                write,
                read,
                client,
                used_bytes: AtomicU64::new(0),
                cached: Mutex::new(HashSet::new()),
                policy: Mutex::new(policy),
                queues,
                tasks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        };
        let leftovers = mgr.load().await?;

        {
            let mut tasks = mgr.inner.tasks.lock().await;
            for (idx, rx) in receivers.into_iter().enumerate() {
                tasks.push(tokio::spawn(mgr.clone().upload_worker(idx, rx)));
            }
            tasks.push(tokio::spawn(mgr.clone().trim_loop()));
        }

        info!(
            "disk cache at {} ready: {} bytes used, {} leftover uploads",
            mgr.inner.cfg.cache_dir.display(),
            mgr.used_bytes(),
            leftovers.len()
        );
        for name in leftovers {
            if let Err(e) = mgr.async_upload(&name).await {
                error!("upload leftover cache file {name} failed: {e}");
            }
        }
        Ok(mgr)
    }

    pub fn cache_type(&self) -> DiskCacheType {
        self.inner.cfg.cache_type
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cfg.cache_dir
    }

    pub fn client(&self) -> &ObjectClient<B> {
        &self.inner.client
    }

    /// Rebuild the counter, the name set and the eviction order from disk.
    /// Returns the names still waiting in the write area.
    async fn load(&self) -> Result<Vec<String>> {
        let writes = self.inner.write.scan().await?;
        let mut reads = self.inner.read.scan().await?;

        let mut seen = HashSet::new();
        let used: u64 = writes
            .iter()
            .chain(reads.iter())
            .filter(|f| seen.insert(f.file_id))
            .map(|f| f.size)
            .sum();
        self.inner.used_bytes.store(used, Ordering::SeqCst);

        reads.sort_by_key(|f| f.modified);
        {
            let mut policy = self.inner.policy.lock().await;
            for f in &reads {
                policy.insert(&f.name, f.size);
            }
        }
        let mut cached = self.inner.cached.lock().await;
        cached.extend(reads.into_iter().map(|f| f.name));
        let leftovers: Vec<String> = writes.into_iter().map(|f| f.name).collect();
        cached.extend(leftovers.iter().cloned());
        Ok(leftovers)
    }

    fn add_used(&self, n: u64) {
        self.inner.used_bytes.fetch_add(n, Ordering::SeqCst);
    }

    fn sub_used(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self
            .inner
            .used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| {
                Some(u.saturating_sub(n))
            });
    }

    /// Create or overwrite `name` in the write area.
    pub async fn write_through(&self, name: &str, buf: &[u8]) -> Result<()> {
        self.inner
            .throttle
            .acquire(IoKind::Write, buf.len() as u64)
            .await;
        let freed = self.inner.write.write(name, buf).await?;
        self.add_used(buf.len() as u64);
        self.sub_used(freed);
        self.inner.cached.lock().await.insert(name.to_string());
        Ok(())
    }

    /// Queue `name` for upload on a random queue, or upload it inline when
    /// that queue is full or stopped.
    pub async fn async_upload(&self, name: &str) -> Result<()> {
        let idx = rand::rng().random_range(0..self.inner.queues.len());
        match self.inner.queues[idx].try_send(name.to_string()) {
            Ok(()) => {
                trace!("queued {name} on upload queue {idx}");
                Ok(())
            }
            Err(e) => {
                warn!("upload queue {idx} unavailable ({e}), uploading {name} inline");
                self.upload(name).await
            }
        }
    }

    /// Upload one write-area file, move it to the read area and drop the
    /// write copy. A name no longer in the write area was already uploaded.
    pub async fn upload(&self, name: &str) -> Result<()> {
        let Some((data, file_id)) = self.inner.write.read_for_upload(name).await? else {
            trace!("{name} already uploaded");
            return Ok(());
        };
        self.inner.client.put_object(name, &data).await?;

        // replaced while uploading; the newer file has its own upload queued
        if self.inner.write.file_id(name).await? != Some(file_id) {
            debug!("{name} changed during upload, keep the newer write file");
            return Ok(());
        }
        match self.inner.read.link_from(&self.inner.write.path(name), name).await {
            Ok(freed) => {
                self.sub_used(freed);
                self.inner
                    .policy
                    .lock()
                    .await
                    .insert(name, data.len() as u64);
            }
            Err(e) => warn!("link {name} into read cache failed: {e}"),
        }
        let freed = self.inner.write.remove(name).await?;
        self.sub_used(freed);
        if !self.inner.read.exists(name).await {
            self.inner.cached.lock().await.remove(name);
        }
        debug!("uploaded {name} ({} bytes)", data.len());
        Ok(())
    }

    /// Upload everything in the write area now. Every file is attempted; the
    /// first failure is returned.
    pub async fn upload_all(&self) -> Result<usize> {
        let files = self.inner.write.scan().await?;
        let results = join_all(files.iter().map(|f| self.upload(&f.name))).await;
        let mut first_err = None;
        let mut uploaded = 0;
        for (f, res) in files.iter().zip(results) {
            match res {
                Ok(()) => uploaded += 1,
                Err(e) => {
                    error!("upload cache file {} failed: {e}", f.name);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(uploaded),
        }
    }

    /// Serve `[offset, offset + len)` of `name` from disk. The write area holds
    /// the newest data, so it is checked first.
    pub async fn read_through(&self, name: &str, offset: u64, len: usize) -> Result<ReadOutcome> {
        self.inner.throttle.acquire(IoKind::Read, len as u64).await;
        if let Some(buf) = self.inner.write.read(name, offset, len).await? {
            return Ok(ReadOutcome::Hit(buf));
        }
        if let Some(buf) = self.inner.read.read(name, offset, len).await? {
            self.inner.policy.lock().await.touch(name);
            return Ok(ReadOutcome::Hit(buf));
        }
        Ok(ReadOutcome::Miss)
    }

    /// Hard-link the write file of `name` into the read area. The bytes are
    /// shared, so usage does not change.
    pub async fn link_to_read_area(&self, name: &str) -> Result<()> {
        let src = self.inner.write.path(name);
        let freed = self.inner.read.link_from(&src, name).await?;
        self.sub_used(freed);
        let size = tokio::fs::metadata(self.inner.read.path(name)).await?.len();
        self.inner.policy.lock().await.insert(name, size);
        self.inner.cached.lock().await.insert(name.to_string());
        Ok(())
    }

    /// Cache data fetched from the object store. Skipped while the cache is
    /// full; returns whether it was stored.
    pub async fn write_read_direct(&self, name: &str, buf: &[u8]) -> Result<bool> {
        if self.is_full() {
            trace!("disk cache full, not caching {name}");
            return Ok(false);
        }
        self.inner
            .throttle
            .acquire(IoKind::Write, buf.len() as u64)
            .await;
        let freed = self.inner.read.write_direct(name, buf).await?;
        self.add_used(buf.len() as u64);
        self.sub_used(freed);
        self.inner
            .policy
            .lock()
            .await
            .insert(name, buf.len() as u64);
        self.inner.cached.lock().await.insert(name.to_string());
        Ok(true)
    }

    pub async fn is_cached(&self, name: &str) -> bool {
        self.inner.cached.lock().await.contains(name)
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.used_bytes.load(Ordering::SeqCst)
    }

    /// Usage in percent: the larger of the cache's own budget use and, when
    /// enabled, the usage of the file system holding the cache.
    pub fn used_ratio(&self) -> u32 {
        let cfg = &self.inner.cfg;
        let mut ratio = if cfg.max_usable_space_bytes > 0 {
            (self.used_bytes().saturating_mul(100) / cfg.max_usable_space_bytes) as u32
        } else {
            0
        };
        if cfg.check_fs_usage {
            match fs_used_ratio(&cfg.cache_dir) {
                Ok(r) => ratio = ratio.max(r),
                Err(e) => debug!("statvfs {} failed: {e}", cfg.cache_dir.display()),
            }
        }
        ratio
    }

    pub fn is_full(&self) -> bool {
        self.used_ratio() >= self.inner.cfg.full_ratio
    }

    pub fn is_safe(&self) -> bool {
        self.used_ratio() < self.inner.cfg.safe_ratio
    }

    /// When full, evict read-area entries until usage drops below the safe
    /// ratio. Returns how many entries were evicted.
    pub async fn trim_once(&self) -> Result<usize> {
        if !self.is_full() {
            return Ok(0);
        }
        info!("disk cache full ({}%), trimming", self.used_ratio());
        let mut evicted = 0;
        while !self.is_safe() {
            let victim = self.inner.policy.lock().await.evict();
            let Some((name, size)) = victim else {
                warn!(
                    "disk cache still at {}% with nothing left to evict",
                    self.used_ratio()
                );
                break;
            };
            let freed = match self.inner.read.remove(&name).await {
                Ok(freed) => freed,
                Err(e) => {
                    self.inner.policy.lock().await.restore(&name, size);
                    return Err(e.into());
                }
            };
            self.sub_used(freed);
            if !self.inner.write.exists(&name).await {
                self.inner.cached.lock().await.remove(&name);
            }
            evicted += 1;
        }
        info!(
            "trimmed {evicted} entries, disk cache at {}%",
            self.used_ratio()
        );
        Ok(evicted)
    }

    async fn trim_loop(self) {
        let interval = self.inner.cfg.trim_check_interval();
        debug!("disk cache trim loop started, interval {interval:?}");
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = sleep(interval) => {
                    if let Err(e) = self.trim_once().await {
                        error!("trim disk cache failed: {e}");
                    }
                }
            }
        }
        debug!("disk cache trim loop stopped");
    }

    async fn upload_worker(self, idx: usize, mut rx: mpsc::Receiver<String>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(name) => {
                        if let Err(e) = self.upload(&name).await {
                            error!("upload queue {idx}: {name} failed: {e}");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("upload queue {idx} stopped");
    }

    /// Stop the trim loop and upload workers, then upload what is left in the
    /// write area.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for t in tasks {
            if let Err(e) = t.await {
                warn!("disk cache task failed: {e}");
            }
        }
        let uploaded = self.upload_all().await?;
        info!("disk cache shut down, {uploaded} files uploaded");
        Ok(())
    }
}

fn fs_used_ratio(path: &Path) -> nix::Result<u32> {
    let st = nix::sys::statvfs::statvfs(path)?;
    let total = st.blocks() as u64;
    let free = st.blocks_free() as u64;
    if total == 0 {
        return Ok(0);
    }
    Ok((total.saturating_sub(free) * 100 / total) as u32)
}
