//! Background workers
//!
//! Submodules:
//! - `worker`: the periodic dirty-inode flush driver
//!
//! The disk cache runs its own upload queues and trim loop; see
//! `chuck::disk_cache::manager`.
pub mod worker;

pub use worker::FlushDriver;
