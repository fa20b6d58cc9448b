//! ChunkStore adapter (cAdapter)
//!
//! Submodules:
//! - `client`: high-level client API used by the block store and disk cache
//! - `throttle`: request rate and inflight-bytes limits
//! - `localfs`: local directory backend, for development and tests
//! - `s3`: S3-compatible backend
//!
//! Responsibilities summary:
//! - Provide an async API for put/get/delete of block objects.
//! - Bound the load on the object store: rate limits and inflight bytes for
//!   asynchronous transfers.
pub mod client;
pub mod localfs;
pub mod s3;
pub mod throttle;
