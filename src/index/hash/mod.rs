//! Extendible hash index over the page cache.

mod bucket;
mod directory;
mod hash_function;
mod hash_index;
mod key_comparator;
mod metadata;
mod serializer;

pub use hash_function::*;
pub use hash_index::*;
pub use key_comparator::*;
pub use serializer::*;
