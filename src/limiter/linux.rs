//! `prlimit(2)`-based limiter
//!
//! Sets `RLIMIT_AS` (address space) on another process by pid.

use nix::errno::Errno;
use nix::libc;

use super::{LimitError, LimitOutcome, MemoryLimiter};

#[derive(Debug, Default, Clone, Copy)]
pub struct PrlimitLimiter;

impl MemoryLimiter for PrlimitLimiter {
    fn apply_memory_limit(&self, pid: u32, max_bytes: u64) -> Result<LimitOutcome, LimitError> {
        if max_bytes == 0 {
            return Ok(LimitOutcome::NotRequested);
        }

        set_address_space_limit(pid, max_bytes).map_err(|errno| LimitError::Os {
            pid,
            max_bytes,
            source: errno.into(),
        })?;

        Ok(LimitOutcome::Applied)
    }
}

fn set_address_space_limit(pid: u32, max_bytes: u64) -> Result<(), Errno> {
    let limit = libc::rlimit {
        rlim_cur: max_bytes as libc::rlim_t,
        rlim_max: max_bytes as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call and a null
    // old-limit pointer is allowed.
    let rc = unsafe {
        libc::prlimit(
            pid as libc::pid_t,
            libc::RLIMIT_AS,
            &limit,
            std::ptr::null_mut(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(Errno::last())
    }
}
