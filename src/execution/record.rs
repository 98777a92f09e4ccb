//! Execution record - the per-program state machine
//!
//! `start` spawns the process and returns at once with status `Running`. A
//! detached task owns the child, waits for exit, deadline or cancellation, and
//! publishes the report exactly once. Readers only ever see `Running` or the
//! settled terminal value.

use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn, Instrument};

use super::cancel::CancelToken;
use super::process::{self, CaptureTask};
use super::status::{ExecutionReport, Status, Termination};
use super::ExecutionEnv;
use crate::limiter::LimitOutcome;
use crate::program::Program;
use crate::runtime::RuntimeId;

/// Upper bound on a deadline that would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("runtime {0} is not configured")]
    RuntimeNotConfigured(RuntimeId),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("execution canceled before start")]
    Canceled,
}

/// A running (or finished) program
#[derive(Debug)]
pub struct ExecutionRecord {
    program: Program,
    pid: u32,
    state: watch::Receiver<Option<Arc<ExecutionReport>>>,
}

impl ExecutionRecord {
    /// Spawn `program` with a deadline derived from its timeout
    ///
    /// `slot` (typically an admission permit) is held until the process has been
    /// reaped, then dropped just before the report is published.
    pub fn start<S>(
        parent: &CancelToken,
        program: Program,
        env: &ExecutionEnv,
        slot: S,
    ) -> Result<Self, StartError>
    where
        S: Send + 'static,
    {
        if parent.is_cancelled() {
            return Err(StartError::Canceled);
        }

        let runtime = env
            .runtimes()
            .get(program.runtime())
            .ok_or(StartError::RuntimeNotConfigured(program.runtime()))?;

        let mut cmd = runtime.command(program.code());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::isolate_group(&mut cmd);

        let spawn_error = |source: std::io::Error| StartError::Spawn {
            program: runtime.program().to_string(),
            source,
        };

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_error(std::io::Error::other("spawned process has no pid")))?;

        // As early as possible; the child is already running user code
        apply_memory_limit(env, pid);

        let stdout = process::spawn_capture(child.stdout.take(), env.max_output_bytes);
        let stderr = process::spawn_capture(child.stderr.take(), env.max_output_bytes);

        debug!(
            "Started {} (pid {}) with timeout {:?}",
            runtime.program(),
            pid,
            program.timeout()
        );

        let deadline = started
            .checked_add(program.timeout())
            .unwrap_or_else(|| started + FAR_FUTURE);

        let supervisor = Supervisor {
            child,
            pid,
            started,
            deadline,
            cancel: parent.clone(),
            grace: env.kill_grace,
            stdout,
            stderr,
        };

        let (tx, state) = watch::channel(None);
        tokio::spawn(
            async move {
                let report = supervisor.run().await;
                drop(slot);
                tx.send_replace(Some(Arc::new(report)));
            }
            .instrument(tracing::Span::current()),
        );

        Ok(Self {
            program,
            pid,
            state,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current status; `Running` until the report is published
    pub fn status(&self) -> Status {
        self.state
            .borrow()
            .as_ref()
            .map(|report| report.status)
            .unwrap_or(Status::Running)
    }

    /// Wait for the terminal status
    pub async fn wait(&self) -> Status {
        self.report().await.status
    }

    /// Wait for the full terminal report
    pub async fn report(&self) -> Arc<ExecutionReport> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|published| (*published).clone());
        settled.unwrap_or_else(|| Arc::new(ExecutionReport::abandoned()))
    }
}

fn apply_memory_limit(env: &ExecutionEnv, pid: u32) {
    match env.limiter.apply_memory_limit(pid, env.max_memory_bytes) {
        Ok(LimitOutcome::Applied) => {
            debug!(
                "Applied memory limit of {} bytes to pid {}",
                env.max_memory_bytes, pid
            );
        }
        Ok(LimitOutcome::NotRequested) => {}
        Ok(LimitOutcome::Unsupported) => {
            warn!(
                "Memory limits are not supported on this platform, pid {} runs unlimited",
                pid
            );
        }
        Err(e) => warn!("Failed to set memory limit: {}", e),
    }
}

enum Stop {
    Exited(std::io::Result<std::process::ExitStatus>),
    DeadlineExceeded,
    Canceled,
}

/// Owns the child for its whole life
struct Supervisor {
    child: Child,
    pid: u32,
    started: Instant,
    deadline: Instant,
    cancel: CancelToken,
    grace: Duration,
    stdout: CaptureTask,
    stderr: CaptureTask,
}

impl Supervisor {
    async fn run(mut self) -> ExecutionReport {
        // Exit is polled first so a program that already finished is never
        // reported as timed out or canceled
        let stop = tokio::select! {
            biased;
            res = process::reap(&mut self.child, self.pid) => Stop::Exited(res),
            _ = sleep_until(self.deadline) => Stop::DeadlineExceeded,
            _ = self.cancel.cancelled() => Stop::Canceled,
        };

        let termination = match stop {
            Stop::Exited(Ok(status)) => Termination::from_exit_status(status),
            Stop::Exited(Err(e)) => {
                warn!("Failed to wait for pid {}: {}", self.pid, e);
                self.stop_group().await;
                Termination::WaitFailed(e.to_string())
            }
            _ if process::has_exited(&mut self.child, self.pid) => self.reap_exited().await,
            Stop::DeadlineExceeded => {
                info!("Program exceeded its deadline, terminating pid {}", self.pid);
                self.stop_group().await;
                Termination::DeadlineExceeded
            }
            Stop::Canceled => {
                info!("Execution canceled, terminating pid {}", self.pid);
                self.stop_group().await;
                Termination::Canceled
            }
        };

        let stdout = process::collect("stdout", self.stdout, self.grace).await;
        let stderr = process::collect("stderr", self.stderr, self.grace).await;
        let truncated = stdout.truncated || stderr.truncated;
        let elapsed = self.started.elapsed();

        debug!("Reaped pid {}: {:?}", self.pid, termination);

        ExecutionReport::new(
            termination,
            stdout.into_string(),
            stderr.into_string(),
            elapsed,
            truncated,
        )
    }

    /// The leader exited on its own just as the deadline or cancel fired
    async fn reap_exited(&mut self) -> Termination {
        match process::reap(&mut self.child, self.pid).await {
            Ok(status) => Termination::from_exit_status(status),
            Err(e) => {
                warn!("Failed to wait for pid {}: {}", self.pid, e);
                Termination::WaitFailed(e.to_string())
            }
        }
    }

    async fn stop_group(&mut self) {
        if let Err(e) = process::terminate(&mut self.child, self.pid, self.grace).await {
            warn!("Failed to reap pid {} after termination: {}", self.pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::CancelSource;
    use crate::runtime::RuntimeRegistry;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    fn env() -> ExecutionEnv {
        ExecutionEnv::new(RuntimeRegistry::builtin().unwrap())
    }

    fn python(code: &str, timeout_secs: f64) -> Program {
        Program::new(RuntimeId::Python3, code, timeout_secs).unwrap()
    }

    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // State follows the parenthesised command name; zombies are dead
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !matches!(rest.trim_start().chars().next(), Some('Z' | 'X')))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn gone_within(pid: u32, limit: Duration) -> bool {
        let until = Instant::now() + limit;
        while Instant::now() < until {
            if !is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !is_alive(pid)
    }

    #[tokio::test]
    async fn test_program_statuses() {
        let source = CancelSource::new();
        let cases = [
            ("import time\ntime.sleep(10)", 1.0, Status::Timeout),
            ("print('hello, world')", 10.0, Status::Done),
        ];

        for (code, timeout_secs, expected) in cases {
            let record =
                ExecutionRecord::start(&source.token(), python(code, timeout_secs), &env(), ())
                    .unwrap();
            assert_eq!(record.status(), Status::Running);

            assert_eq!(record.wait().await, expected);
            assert_eq!(record.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_captures_output() {
        let source = CancelSource::new();
        let record = ExecutionRecord::start(
            &source.token(),
            python("print('hello, world')", 10.0),
            &env(),
            (),
        )
        .unwrap();

        let report = record.report().await;
        assert_eq!(report.termination, Termination::Exited(0));
        assert_eq!(report.stdout, "hello, world\n");
        assert_eq!(report.stderr, "");
        assert!(!report.truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let source = CancelSource::new();
        let code = "import sys\nprint('bad input', file=sys.stderr)\nsys.exit(3)";
        let record =
            ExecutionRecord::start(&source.token(), python(code, 10.0), &env(), ()).unwrap();

        let report = record.report().await;
        assert_eq!(report.status, Status::Error);
        assert_eq!(report.termination, Termination::Exited(3));
        assert_eq!(report.stderr, "bad input\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_self_inflicted_signal() {
        let source = CancelSource::new();
        let code = "import os, signal\nos.kill(os.getpid(), signal.SIGKILL)";
        let record =
            ExecutionRecord::start(&source.token(), python(code, 10.0), &env(), ()).unwrap();

        let report = record.report().await;
        assert_eq!(report.status, Status::Error);
        assert_eq!(report.termination, Termination::Signaled(9));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let registry = RuntimeRegistry::from_toml_str(
            r#"
[python3]
run_command = "/nonexistent/evalrunner-python -c {code}"
"#,
        )
        .unwrap();
        let source = CancelSource::new();

        let err = ExecutionRecord::start(
            &source.token(),
            python("print(1)", 1.0),
            &ExecutionEnv::new(registry),
            (),
        )
        .unwrap_err();
        assert!(matches!(err, StartError::Spawn { ref program, .. } if program == "/nonexistent/evalrunner-python"));
    }

    #[tokio::test]
    async fn test_canceled_parent_never_starts() {
        let source = CancelSource::new();
        let token = source.token();
        source.cancel();

        let err = ExecutionRecord::start(&token, python("print(1)", 1.0), &env(), ()).unwrap_err();
        assert!(matches!(err, StartError::Canceled));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_agree() {
        let source = CancelSource::new();
        let record = ExecutionRecord::start(
            &source.token(),
            python("import time\ntime.sleep(0.2)", 5.0),
            &env(),
            (),
        )
        .unwrap();

        let (a, b) = tokio::join!(record.wait(), record.wait());
        assert_eq!(a, Status::Done);
        assert_eq!(b, Status::Done);
        assert_eq!(record.wait().await, Status::Done);
    }

    #[tokio::test]
    async fn test_slot_released_after_reap() {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let source = CancelSource::new();

        let record = ExecutionRecord::start(
            &source.token(),
            python("import time\ntime.sleep(0.2)", 5.0),
            &env(),
            permit,
        )
        .unwrap();
        assert_eq!(semaphore.available_permits(), 0);

        record.wait().await;
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let source = CancelSource::new();
        let record = ExecutionRecord::start(
            &source.token(),
            python("print('x' * 100000)", 10.0),
            &env().with_max_output_bytes(1000),
            (),
        )
        .unwrap();

        let report = record.report().await;
        assert_eq!(report.status, Status::Done);
        assert_eq!(report.stdout.len(), 1000);
        assert!(report.truncated);
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_program_is_killed() {
        let source = CancelSource::new();
        let code = "import signal, time\nsignal.signal(signal.SIGTERM, signal.SIG_IGN)\ntime.sleep(30)";
        let record = ExecutionRecord::start(
            &source.token(),
            python(code, 0.5),
            &env().with_kill_grace(Duration::from_millis(300)),
            (),
        )
        .unwrap();

        let status = timeout(Duration::from_secs(5), record.wait()).await.unwrap();
        assert_eq!(status, Status::Timeout);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_terminates_process() {
        let source = CancelSource::new();
        let record = ExecutionRecord::start(
            &source.token(),
            python("import time\ntime.sleep(30)", 60.0),
            &env(),
            (),
        )
        .unwrap();
        let pid = record.pid();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(is_alive(pid));
        source.cancel();

        let report = timeout(Duration::from_secs(5), record.report()).await.unwrap();
        assert_eq!(report.status, Status::Error);
        assert_eq!(report.termination, Termination::Canceled);
        assert!(gone_within(pid, Duration::from_secs(2)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let code = format!(
            "import subprocess, time\np = subprocess.Popen(['sleep', '30'])\nopen({:?}, 'w').write(str(p.pid))\ntime.sleep(30)",
            pid_file.display().to_string()
        );
        let source = CancelSource::new();
        let record =
            ExecutionRecord::start(&source.token(), python(&code, 1.5), &env(), ()).unwrap();

        assert_eq!(record.wait().await, Status::Timeout);

        let grandchild: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(gone_within(grandchild, Duration::from_secs(2)).await);
        assert!(!is_alive(record.pid()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_escaped_descendant_keeps_partial_output() {
        let code = "import subprocess, sys, time\nprint('hello', flush=True)\nsubprocess.Popen(['setsid', 'sleep', '3'])\ntime.sleep(0.2)\nsys.exit(0)";
        let source = CancelSource::new();
        let record = ExecutionRecord::start(
            &source.token(),
            python(code, 10.0),
            &env().with_kill_grace(Duration::from_millis(300)),
            (),
        )
        .unwrap();

        let report = timeout(Duration::from_secs(5), record.report()).await.unwrap();
        assert_eq!(report.status, Status::Done);
        assert_eq!(report.stdout, "hello\n");
        assert!(report.truncated);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_clean_exit_sweeps_leftover_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("straggler.pid");
        let code = format!(
            "import subprocess\np = subprocess.Popen(['sleep', '30'], stdout=subprocess.DEVNULL, stderr=subprocess.DEVNULL)\nopen({:?}, 'w').write(str(p.pid))",
            pid_file.display().to_string()
        );
        let source = CancelSource::new();
        let record =
            ExecutionRecord::start(&source.token(), python(&code, 10.0), &env(), ()).unwrap();

        let report = timeout(Duration::from_secs(5), record.report()).await.unwrap();
        assert_eq!(report.status, Status::Done);
        assert!(!report.truncated);

        let straggler: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(gone_within(straggler, Duration::from_secs(2)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_wins_over_elapsed_deadline_and_cancel() {
        let mut cmd = tokio::process::Command::new("true");
        process::isolate_group(&mut cmd);
        let child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        // Exited but not yet reaped when the supervisor first looks
        tokio::time::sleep(Duration::from_millis(300)).await;

        let source = CancelSource::new();
        source.cancel();
        let now = Instant::now();
        let supervisor = Supervisor {
            child,
            pid,
            started: now,
            deadline: now,
            cancel: source.token(),
            grace: Duration::from_millis(300),
            stdout: process::spawn_capture(None::<tokio::process::ChildStdout>, 16),
            stderr: process::spawn_capture(None::<tokio::process::ChildStderr>, 16),
        };

        let report = timeout(Duration::from_secs(5), supervisor.run()).await.unwrap();
        assert_eq!(report.termination, Termination::Exited(0));
        assert_eq!(report.status, Status::Done);
    }

    #[derive(Debug, Default)]
    struct RecordingLimiter {
        calls: std::sync::Mutex<Vec<(u32, u64)>>,
    }

    impl crate::limiter::MemoryLimiter for RecordingLimiter {
        fn apply_memory_limit(
            &self,
            pid: u32,
            max_bytes: u64,
        ) -> Result<LimitOutcome, crate::limiter::LimitError> {
            self.calls.lock().unwrap().push((pid, max_bytes));
            Ok(LimitOutcome::Unsupported)
        }
    }

    #[tokio::test]
    async fn test_limiter_sees_child_pid_and_never_fails_run() {
        let limiter = Arc::new(RecordingLimiter::default());
        let env = env()
            .with_limiter(limiter.clone())
            .with_max_memory_bytes(64 << 20);
        let source = CancelSource::new();

        let record =
            ExecutionRecord::start(&source.token(), python("print(1)", 5.0), &env, ()).unwrap();
        assert_eq!(record.wait().await, Status::Done);
        assert_eq!(*limiter.calls.lock().unwrap(), vec![(record.pid(), 64 << 20)]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_limit_applies() {
        let source = CancelSource::new();
        let record = ExecutionRecord::start(
            &source.token(),
            python("x = bytearray(2 * 1024 * 1024 * 1024)", 10.0),
            &env().with_max_memory_bytes(256 * 1024 * 1024),
            (),
        )
        .unwrap();

        let report = record.report().await;
        assert_eq!(report.status, Status::Error);
        assert_eq!(report.termination, Termination::Exited(1));
        assert!(report.stderr.contains("MemoryError"));
    }
}
