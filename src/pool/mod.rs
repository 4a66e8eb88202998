mod pool_factory;
mod reentrant_pool;
mod resource_pool;

pub use pool_factory::*;
pub use reentrant_pool::*;
pub use resource_pool::*;
