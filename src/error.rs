//! Error types for the fiber runtime.
//!
//! Only recoverable conditions are reported through [`Error`]. Broken
//! scheduler invariants (resuming a fiber that is not waiting, dropping a
//! joinable fiber, leaking a timer) abort the process via [`fatal!`].

use thiserror::Error;

/// Errors surfaced by runtime construction and fiber submission.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No scheduling algorithm is registered under this name.
    #[error("unknown scheduling algorithm `{0}`")]
    UnknownScheduling(String),

    /// The run queue stayed full for every retry.
    #[error("run queue overflow")]
    RunQueueOverflow,

    /// The requested scheduling group id does not exist.
    #[error("scheduling group {0} does not exist")]
    NoSuchGroup(usize),

    /// The OS refused to create a worker or timer thread.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// The caller is neither a fiber nor a worker of a running runtime.
    #[error("not running inside a fiber runtime")]
    NoRuntime,

    /// A worker thread terminated by panicking.
    #[error("fiber worker {0} panicked")]
    WorkerPanicked(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Logs a contract violation and aborts.
///
/// Used where continuing would corrupt scheduler state; unwinding is not an
/// option because the caller may be running on a fiber stack mid-switch.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        tracing::error!($($arg)+);
        eprintln!("[fiberrt] fatal: {}", format_args!($($arg)+));
        std::process::abort()
    }};
}

pub(crate) use fatal;

/// Rate-limited warning: at most once per second per call site.
macro_rules! warn_every_second {
    ($($arg:tt)+) => {{
        static LAST: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let now = $crate::timer::monotonic_nanos();
        let last = LAST.load(std::sync::atomic::Ordering::Relaxed);
        if now.saturating_sub(last) >= 1_000_000_000
            && LAST
                .compare_exchange(last, now, std::sync::atomic::Ordering::Relaxed, std::sync::atomic::Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!($($arg)+);
        }
    }};
}

pub(crate) use warn_every_second;
