//! Execution module - one program, one child process
//!
//! This module runs a single validated `Program` under a hard deadline:
//! - `ExecutionRecord`: spawn, limit, supervise and report one process
//! - `CancelSource`/`CancelToken`: request-scoped cancellation
//! - `Status`/`ExecutionReport`: the terminal outcome
//!
//! The execution module does NOT:
//! - Validate requests (see `program`)
//! - Decide admission or ordering (see `dispatcher`)
//! - Shape caller-facing results (see `result`)

pub mod cancel;
pub mod process;
pub mod record;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use crate::limiter::{platform_limiter, MemoryLimiter};
use crate::runtime::RuntimeRegistry;

pub use cancel::{CancelSource, CancelToken};
pub use record::{ExecutionRecord, StartError};
pub use status::{ExecutionReport, Termination};

/// Default time between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);
/// Default cap on captured bytes per stream
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Everything a record needs besides the program itself
#[derive(Debug, Clone)]
pub struct ExecutionEnv {
    runtimes: Arc<RuntimeRegistry>,
    limiter: Arc<dyn MemoryLimiter>,
    /// 0 means no memory limit
    max_memory_bytes: u64,
    kill_grace: Duration,
    max_output_bytes: usize,
}

impl ExecutionEnv {
    pub fn new(runtimes: RuntimeRegistry) -> Self {
        Self {
            runtimes: Arc::new(runtimes),
            limiter: platform_limiter(),
            max_memory_bytes: 0,
            kill_grace: DEFAULT_KILL_GRACE,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    #[cfg(test)]
    pub fn with_limiter(mut self, limiter: Arc<dyn MemoryLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_max_memory_bytes(mut self, max_memory_bytes: u64) -> Self {
        self.max_memory_bytes = max_memory_bytes;
        self
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn runtimes(&self) -> &RuntimeRegistry {
        &self.runtimes
    }
}
