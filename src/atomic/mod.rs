mod atomic_operation;
mod operations_manager;
mod page_reader;
mod redo_log;

pub use atomic_operation::*;
pub use operations_manager::*;
pub use page_reader::*;
pub use redo_log::*;
