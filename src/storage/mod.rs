pub mod disk;
pub mod page;

pub use disk::*;
pub use page::*;
