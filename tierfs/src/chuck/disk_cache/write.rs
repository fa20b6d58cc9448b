//! Write-back area: files written locally and waiting for upload.

use super::{CachedFile, area_dir, read_range, remove_freed, scan_dir, write_atomic};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::trace;

pub const WRITE_DIR: &str = "cachewrite";

#[derive(Debug, Clone)]
pub struct DiskCacheWrite {
    dir: PathBuf,
}

impl DiskCacheWrite {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: area_dir(cache_dir, WRITE_DIR),
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

    /// Create or replace `name`; returns bytes freed by the replaced file.
    pub async fn write(&self, name: &str, buf: &[u8]) -> io::Result<u64> {
        trace!("write cache file {name} ({} bytes)", buf.len());
        write_atomic(&self.dir, name, buf).await
    }

    pub async fn read(&self, name: &str, offset: u64, len: usize) -> io::Result<Option<Vec<u8>>> {
        read_range(&self.path(name), offset, len).await
    }

    /// Whole file plus its `(dev, ino)`, read through one handle.
    pub async fn read_for_upload(&self, name: &str) -> io::Result<Option<(Vec<u8>, (u64, u64))>> {
        let mut f = match fs::File::open(self.path(name)).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let meta = f.metadata().await?;
        let mut buf = Vec::with_capacity(meta.len() as usize);
        f.read_to_end(&mut buf).await?;
        Ok(Some((buf, (meta.dev(), meta.ino()))))
    }

    /// `(dev, ino)` of the current file, if any.
    pub async fn file_id(&self, name: &str) -> io::Result<Option<(u64, u64)>> {
        match fs::metadata(self.path(name)).await {
            Ok(m) => Ok(Some((m.dev(), m.ino()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
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
