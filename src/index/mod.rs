//! Index structures
//!
//! - `hash`: extendible hash index with ordered scans over the hash space

pub mod hash;

pub use hash::*;
