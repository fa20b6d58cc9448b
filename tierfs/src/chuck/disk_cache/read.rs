//! Read-through area: confirmed copies, eligible for eviction.

use super::{CachedFile, area_dir, read_range, remove_freed, scan_dir, write_atomic};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::trace;

pub const READ_DIR: &str = "cacheread";

#[derive(Debug, Clone)]
pub struct DiskCacheRead {
    dir: PathBuf,
}

impl DiskCacheRead {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: area_dir(cache_dir, READ_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    pub async fn read(&self, name: &str, offset: u64, len: usize) -> io::Result<Option<Vec<u8>>> {
        read_range(&self.path(name), offset, len).await
    }

    /// Store data fetched from the object store; returns bytes freed by a
    /// replaced copy.
    pub async fn write_direct(&self, name: &str, buf: &[u8]) -> io::Result<u64> {
        write_atomic(&self.dir, name, buf).await
    }

    /// Hard-link `src` in as `name`, replacing any older copy. Returns bytes
    /// freed by the replaced copy.
    pub async fn link_from(&self, src: &Path, name: &str) -> io::Result<u64> {
        let dest = self.path(name);
        let freed = remove_freed(&dest).await?;
        fs::hard_link(src, &dest).await?;
        trace!("linked {} into read cache", name);
        Ok(freed)
    }

    pub async fn exists(&self, name: &str) -> bool {
        fs::try_exists(self.path(name)).await.unwrap_or(false)
    }

    /// Returns bytes released on disk.
    pub async fn remove(&self, name: &str) -> io::Result<u64> {
        remove_freed(&self.path(name)).await
    }

    pub async fn scan(&self) -> io::Result<Vec<CachedFile>> {
        scan_dir(&self.dir).await
    }
}
