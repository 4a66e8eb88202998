mod io_service;
mod paged_file;

pub use io_service::*;
pub use paged_file::*;
