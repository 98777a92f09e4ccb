//! Execution status and the terminal report of a finished program

use serde::Serialize;
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

/// Lifecycle status of one execution
///
/// `Running` is the only initial state. The other three are terminal and are set
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Running,
    Done,
    Error,
    Timeout,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Running => "running",
            Status::Done => "done",
            Status::Error => "error",
            Status::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Why the process stopped (raw, no result interpretation)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by a signal we did not send
    Signaled(i32),
    /// Deadline elapsed; the process group was terminated
    DeadlineExceeded,
    /// The owning request was canceled; the process group was terminated
    Canceled,
    /// Waiting on the process failed
    WaitFailed(String),
    /// The supervising task went away without publishing a result
    Abandoned,
}

impl Termination {
    pub fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Termination::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Termination::Signaled(sig);
            }
        }

        Termination::WaitFailed(format!("process ended without an exit code: {}", status))
    }

    /// Coarse status: only a clean zero exit is `Done`
    pub fn status(&self) -> Status {
        match self {
            Termination::Exited(0) => Status::Done,
            Termination::DeadlineExceeded => Status::Timeout,
            _ => Status::Error,
        }
    }
}

/// Everything known about a finished execution
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: Status,
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time from spawn to reap
    pub elapsed: Duration,
    /// Output beyond the per-stream cap was discarded
    pub truncated: bool,
}

impl ExecutionReport {
    pub fn new(
        termination: Termination,
        stdout: String,
        stderr: String,
        elapsed: Duration,
        truncated: bool,
    ) -> Self {
        Self {
            status: termination.status(),
            termination,
            stdout,
            stderr,
            elapsed,
            truncated,
        }
    }

    pub fn abandoned() -> Self {
        Self::new(
            Termination::Abandoned,
            String::new(),
            String::new(),
            Duration::ZERO,
            false,
        )
    }
}
