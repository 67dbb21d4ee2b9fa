//! Fiber stack allocation.

pub mod pool;
pub mod stack;

pub use pool::StackPool;
pub use stack::{FiberStack, STACK_MAGIC, StackOrigin};
