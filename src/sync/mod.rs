//! Fiber-aware synchronization primitives.
//!
//! Each primitive works from fibers and from plain OS threads. A fiber that
//! blocks is suspended and its worker moves on; a thread blocks on a private
//! wait slot.

pub mod condvar;
pub mod event;
pub mod exit_barrier;
pub mod mutex;
pub mod timer;
pub(crate) mod waitable;

pub use condvar::{ConditionVariable, WaitTimeoutResult};
pub use event::{Event, OneshotTimedEvent};
pub use exit_barrier::{ExitBarrier, ExitBarrierLock};
pub use mutex::{Mutex, MutexGuard};
pub use timer::WaitableTimer;
