//! Durable JSON artifacts: atomic writes, digests and the registry cache file.

pub mod cache;
pub mod files;

pub use cache::CacheStore;
pub use files::{file_sha256, read_json, remove_temp_files, write_json_atomic};
