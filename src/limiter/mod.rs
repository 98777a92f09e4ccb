//! Limiter module - best-effort resource ceilings for started processes
//!
//! This module applies a virtual-memory ceiling to a child that is already
//! running. It handles:
//! - Platform selection (`prlimit` on Linux, an explicit "unsupported" elsewhere)
//! - Treating a zero ceiling as "no limit requested"
//!
//! The limiter does NOT:
//! - Guarantee the ceiling holds from the first instruction. The child starts
//!   before the limit lands, so there is a short window in which it can allocate
//!   without bound. Closing it needs a stopped start (limit, then resume).
//! - Fail an execution. Callers log the outcome and carry on.

#[cfg(target_os = "linux")]
mod linux;
mod unsupported;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub use linux::PrlimitLimiter;
pub use unsupported::UnsupportedLimiter;

/// Limiter used by default on this target
#[cfg(target_os = "linux")]
pub type PlatformLimiter = PrlimitLimiter;
#[cfg(not(target_os = "linux"))]
pub type PlatformLimiter = UnsupportedLimiter;

/// What happened when a limit was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    /// The ceiling is now in place
    Applied,
    /// Nothing to do (`max_bytes == 0`)
    NotRequested,
    /// This platform cannot limit a separate, running process
    Unsupported,
}

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("failed to set memory limit of {max_bytes} bytes on pid {pid}: {source}")]
    Os {
        pid: u32,
        max_bytes: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Applies a memory ceiling to a running process
pub trait MemoryLimiter: fmt::Debug + Send + Sync {
    fn apply_memory_limit(&self, pid: u32, max_bytes: u64) -> Result<LimitOutcome, LimitError>;
}

/// The limiter for the current target
pub fn platform_limiter() -> Arc<dyn MemoryLimiter> {
    Arc::new(PlatformLimiter::default())
}
