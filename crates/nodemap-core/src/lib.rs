//! nodemap core library: registry cache builder and node-type mapping index.
//!
//! The cache builder (`indexer`) mirrors a package registry into a durable
//! JSON cache in three incremental phases. The mapping engine (`mapping`)
//! turns that cache into a ranked node-signature index and reconciles it
//! with the community extension map. With the `python` feature the crate is
//! also built as the `_nodemap_core` extension module.

pub mod community;
pub mod config;
pub mod errors;
pub mod indexer;
pub mod mapping;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod validate;

#[cfg(feature = "python")]
mod python;

pub use errors::{NodemapError, NodemapResult};
