mod config;
mod error;
mod sync;
mod types;

pub use config::*;
pub use error::*;
pub use sync::*;
pub use types::*;
