mod change_portion;
mod change_set;
mod page_view;

pub use change_portion::*;
pub use change_set::*;
pub use page_view::*;
