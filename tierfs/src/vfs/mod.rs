//! VFS layer: inode state, the inode cache and the object-storage data path
//!
//! Responsibilities:
//! - Keep each inode's attributes and chunk map in memory and sync them to the
//!   metadata service without losing concurrent updates.
//! - Bound the number of resident inodes and flush dirty ones, including those
//!   pushed out of the cache.
//! - Drive writes and reads through the block store and record the resulting
//!   chunk descriptors.
//!
//! Submodules:
//! - `inode`: one inode's state, locks and sync
//! - `cache`: LRU-bounded inode table and dirty-flush pipeline
//! - `adaptor`: object-storage backed write/read/truncate/sync
//! - `demo`: end-to-end demo used by the `tierfs demo` command
pub mod adaptor;
pub mod cache;
pub mod demo;
pub mod inode;

pub use adaptor::ObjectDataPath;
pub use cache::{FlushReport, InodeCache};
pub use inode::{InodeRecord, InodeStatus};
