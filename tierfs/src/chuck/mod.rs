//! Chunk and block management (chuck)
//!
//! Responsibilities:
//! - Describe file content as per-chunk-index lists of immutable chunk
//!   descriptors, and edit those lists (append, merge, remove, compact).
//! - Map descriptors to block objects and turn chunk-local writes and reads
//!   into block-object I/O.
//! - Cache block objects on local disk in front of the object store.
//!
//! Submodules:
//! - `chunk`: chunk/block layout and offset helpers
//! - `slice`: chunk descriptors and their block spans
//! - `extent`: per-chunk-index descriptor lists and compaction
//! - `util`: splitting file ranges into chunk pieces
//! - `store`: block store trait and implementations
//! - `writer` / `reader`: chunk-local write and read paths
//! - `disk_cache`: write-back and read-through disk cache tier
pub mod chunk;
pub mod disk_cache;
pub mod extent;
pub mod reader;
pub mod slice;
pub mod store;
pub mod util;
pub mod writer;

pub use chunk::ChunkLayout;
pub use extent::ChunkIndexMap;
pub use slice::ChunkDescriptor;
