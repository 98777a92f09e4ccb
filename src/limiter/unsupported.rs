//! Fallback for targets that cannot limit another process's memory

use super::{LimitError, LimitOutcome, MemoryLimiter};

/// Reports every real request as unsupported
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedLimiter;

impl MemoryLimiter for UnsupportedLimiter {
    fn apply_memory_limit(&self, _pid: u32, max_bytes: u64) -> Result<LimitOutcome, LimitError> {
        if max_bytes == 0 {
            return Ok(LimitOutcome::NotRequested);
        }
        Ok(LimitOutcome::Unsupported)
    }
}
