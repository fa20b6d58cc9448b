//! Metadata service collaborator
//!
//! Responsibilities:
//! - Define the inode and attribute records the cache keeps per file.
//! - Define the semantic contract of the metadata service (`MetaClient`): inode
//!   get/create/update/delete, chunk-info get-or-modify and chunk-id allocation.
//!   Transport, encoding and retries belong to the implementor.
//!
//! Submodules:
//! - `memory`: single-process implementation used by the demo binary and tests
pub mod memory;
#[cfg(test)]
pub(crate) mod scripted;

pub use memory::InMemoryMetaClient;

use crate::chuck::extent::ChunkIndexMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Param(String),

    #[error("metadata service failure: {0}")]
    Remote(String),
}

pub type MetaResult<T> = Result<T, MetaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Dir,
    Symlink,
}

/// Wall-clock time with nanosecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: u64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs(),
            nsec: d.subsec_nanos(),
        }
    }
}

/// Attributes the cache tracks for one inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub fs_id: u32,
    pub inode_id: u64,
    pub kind: FileType,
    pub length: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u32,
    pub rdev: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// Whether some client holds the file open.
    pub open_flag: bool,
    pub symlink: Option<String>,
}

/// An inode as returned by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub attr: InodeAttr,
    pub chunks: ChunkIndexMap,
}

#[derive(Debug, Clone)]
pub struct InodeParam {
    pub fs_id: u32,
    pub kind: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub symlink: Option<String>,
}

impl InodeParam {
    pub fn file(fs_id: u32, mode: u32) -> Self {
        Self {
            fs_id,
            kind: FileType::File,
            mode,
            uid: 0,
            gid: 0,
            rdev: 0,
            symlink: None,
        }
    }
}

/// Arguments of `get_or_modify_chunk_info`.
#[derive(Debug, Clone, Default)]
pub struct ChunkInfoRequest {
    pub fs_id: u32,
    pub inode_id: u64,
    pub add: ChunkIndexMap,
    pub remove: ChunkIndexMap,
    /// Return the full map after the modification.
    pub return_map: bool,
    /// Apply `add`/`remove` as a compaction batch.
    pub from_compaction: bool,
}

/// Semantic contract of the metadata service.
///
/// Every call is expected to be already retried by the implementor; the cache
/// treats the result as final.
#[async_trait]
pub trait MetaClient: Send + Sync {
    async fn get_inode(&self, fs_id: u32, inode_id: u64) -> MetaResult<Inode>;

    async fn create_inode(&self, param: InodeParam) -> MetaResult<Inode>;

    async fn delete_inode(&self, fs_id: u32, inode_id: u64) -> MetaResult<()>;

    /// Overwrite the attributes of an existing inode. The chunk map is untouched.
    async fn update_inode(&self, attr: &InodeAttr) -> MetaResult<()>;

    /// Merge `add` then apply `remove` (or the compaction variant), skipping a
    /// batch that was already applied, and optionally return the resulting map.
    async fn get_or_modify_chunk_info(
        &self,
        req: ChunkInfoRequest,
    ) -> MetaResult<Option<ChunkIndexMap>>;

    /// Next chunk id for `fs_id`; strictly increasing.
    async fn allocate_chunk_id(&self, fs_id: u32) -> MetaResult<u64>;
}
