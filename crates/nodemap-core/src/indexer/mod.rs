//! Progressive registry cache builder.
//!
//! Three phases run against a [`crate::registry::RegistryClient`]:
//! basic info from the paginated listing, version lists for nodes whose
//! refresh record is set, then per-version node metadata. Phases 2 and 3 fan
//! out in bounded groups and checkpoint the cache after every batch.

pub mod basic;
pub mod batch;
pub mod metadata;
pub mod pipeline;
pub mod versions;

pub use pipeline::{BuildStats, CacheBuilder};
