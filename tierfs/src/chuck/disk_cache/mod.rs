//! Local disk cache tier
//!
//! Two plain directories under the cache dir, keyed by object name:
//!
//! - `cachewrite`: write-back area, data not yet confirmed in the object store
//! - `cacheread`: read-through area, confirmed copies that may be evicted
//!
//! After an upload the write file is hard-linked into the read area and then
//! removed, so the bytes stay on disk once. Presence in a directory is the only
//! index; the manager rebuilds its in-memory view with a scan at startup.
//!
//! Submodules:
//! - `write`: write-area file operations
//! - `read`: read-area file operations
//! - `policy`: eviction candidate selection for trimming
//! - `manager`: accounting, upload queues, trim loop
pub mod manager;
pub mod policy;
pub mod read;
pub mod write;

pub use manager::{DiskCacheManager, ReadOutcome};
pub use policy::{EvictionPolicy, LruEviction};

use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Suffix of files being written; never visible under their final name.
pub(crate) const TMP_SUFFIX: &str = ".tmp";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskCacheType {
    #[default]
    Disable,
    /// Cache remote reads only; writes go straight to the object store.
    OnlyRead,
    /// Write back through the disk and cache reads.
    ReadWrite,
}

/// A file found by a directory scan.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    /// `(dev, ino)`; equal for hard links of the same data.
    pub file_id: (u64, u64),
}

/// Write `buf` under `dir/name` through a temporary file and rename.
///
/// Returns the bytes freed by replacing a previous file of the same name: its
/// size if that was its last link, otherwise zero.
pub(crate) async fn write_atomic(dir: &Path, name: &str, buf: &[u8]) -> io::Result<u64> {
    let path = dir.join(name);
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = dir.join(format!("{name}.{seq}{TMP_SUFFIX}"));
    let res: io::Result<u64> = async {
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(buf).await?;
        f.sync_data().await?;
        let freed = last_link_size(&path).await?;
        fs::rename(&tmp, &path).await?;
        Ok(freed)
    }
    .await;
    if res.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    res
}

/// `[offset, offset + len)` of a file, clipped at its end; `None` if missing.
pub(crate) async fn read_range(path: &Path, offset: u64, len: usize) -> io::Result<Option<Vec<u8>>> {
    let mut f = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    f.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len);
    f.take(len as u64).read_to_end(&mut buf).await?;
    Ok(Some(buf))
}

/// Remove a file; returns the bytes actually released on disk.
pub(crate) async fn remove_freed(path: &Path) -> io::Result<u64> {
    let freed = last_link_size(path).await?;
    match fs::remove_file(path).await {
        Ok(()) => Ok(freed),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn last_link_size(path: &Path) -> io::Result<u64> {
    match fs::metadata(path).await {
        Ok(m) if m.nlink() <= 1 => Ok(m.len()),
        Ok(_) => Ok(0),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// List regular files of `dir`. Leftover temporary files are deleted.
pub(crate) async fn scan_dir(dir: &Path) -> io::Result<Vec<CachedFile>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.ends_with(TMP_SUFFIX) {
            let _ = fs::remove_file(entry.path()).await;
            continue;
        }
        out.push(CachedFile {
            name,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            file_id: (meta.dev(), meta.ino()),
        });
    }
    Ok(out)
}

pub(crate) fn area_dir(cache_dir: &Path, area: &str) -> PathBuf {
    cache_dir.join(area)
}
