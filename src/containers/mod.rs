//! Coordination containers.
//!
//! - [`FutureMap`]: keyed registry of eventually-delivered values
//! - [`FutureQueue`]: strict-FIFO queue of pending futures
//! - [`ResourcePool`]: bounded borrow/return pool with deferred teardown
//!
//! The deque role throughout is played by [`std::collections::VecDeque`].

mod future_map;
mod future_queue;
mod resource_pool;

pub use future_map::FutureMap;
pub use future_queue::FutureQueue;
pub use resource_pool::{PoolItem, ResourcePool};
