//! Signature mapping: build from the registry cache, augment from the
//! community map, rank, and look up.

pub mod augment;
pub mod builder;
pub mod lookup;
pub mod scoring;
pub mod signature;
pub mod url;
pub mod version;

pub use augment::{AugmentStats, Augmenter};
pub use builder::MappingBuilder;
pub use lookup::Resolution;
