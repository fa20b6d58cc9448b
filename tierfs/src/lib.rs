// Library crate for tierfs: re-export internal modules for the binary and integration tests.

pub mod cadapter;
pub mod chuck;
pub mod config;
pub mod daemon;
pub mod error;
pub mod meta;
pub mod vfs;

pub use error::{Error, Result};
