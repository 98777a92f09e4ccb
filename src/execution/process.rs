//! Child process plumbing
//!
//! Each program runs as the leader of its own process group so that the
//! interpreter and anything it forks can be signalled together.

use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(target_os = "linux")]
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
#[cfg(unix)]
use nix::unistd::Pid;

/// Put the child in a fresh process group led by itself
#[cfg(unix)]
pub fn isolate_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub fn isolate_group(_cmd: &mut Command) {}

/// Send `signal` to the group; false if the group no longer exists
#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to send {} to process group {}: {}", signal, pgid, e);
            false
        }
    }
}

/// Stop a running child: SIGTERM to the group, then SIGKILL after `grace`
#[cfg(unix)]
pub async fn terminate(child: &mut Child, pgid: u32, grace: Duration) -> io::Result<ExitStatus> {
    signal_group(pgid, Signal::SIGTERM);
    if let Ok(status) = tokio::time::timeout(grace, reap(child, pgid)).await {
        return status;
    }

    debug!(
        "Process group {} still alive {:?} after SIGTERM, sending SIGKILL",
        pgid, grace
    );
    signal_group(pgid, Signal::SIGKILL);
    reap(child, pgid).await
}

#[cfg(not(unix))]
pub async fn terminate(child: &mut Child, pgid: u32, _grace: Duration) -> io::Result<ExitStatus> {
    child.start_kill()?;
    reap(child, pgid).await
}

/// Wait for the leader to exit, kill what is left of its group, then reap it
///
/// On Linux the leader stays a zombie until the sweep is done, so its pid (the
/// group id) cannot be handed to an unrelated process in between. Elsewhere the
/// sweep follows the reap and a recycled id could in principle be hit.
#[cfg(target_os = "linux")]
pub async fn reap(child: &mut Child, pgid: u32) -> io::Result<ExitStatus> {
    exited(pgid).await?;
    sweep_group(pgid);
    child.wait().await
}

#[cfg(not(target_os = "linux"))]
pub async fn reap(child: &mut Child, pgid: u32) -> io::Result<ExitStatus> {
    let status = child.wait().await;
    sweep_group(pgid);
    status
}

/// Block (off the runtime) until `pid` has exited, without reaping it
#[cfg(target_os = "linux")]
async fn exited(pid: u32) -> io::Result<()> {
    tokio::task::spawn_blocking(move || loop {
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    })
    .await
    .map_err(io::Error::other)?
}

/// Whether the leader has already exited; never reaps it on Linux
#[cfg(target_os = "linux")]
pub fn has_exited(_child: &mut Child, pid: u32) -> bool {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
    match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn has_exited(child: &mut Child, _pid: u32) -> bool {
    matches!(child.try_wait(), Ok(Some(_)))
}

/// Kill whatever is left in the group once the leader is gone
#[cfg(unix)]
fn sweep_group(pgid: u32) {
    if signal_group(pgid, Signal::SIGKILL) {
        debug!("Killed leftover processes in group {}", pgid);
    }
}

#[cfg(not(unix))]
fn sweep_group(_pgid: u32) {}

/// Bytes read from one output stream
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if chunk.len() > room {
            self.truncated = true;
        }
    }
}

/// Output read so far, shared by the reader task and `collect`
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Captured>>);

impl CaptureBuffer {
    fn push(&self, chunk: &[u8], limit: usize) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk, limit);
    }

    pub fn take(&self) -> Captured {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Drain `reader` to EOF into `buffer`, keeping at most `limit` bytes
pub async fn capture<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    buffer: &CaptureBuffer,
) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.push(&buf[..n], limit);
    }
}

/// A running reader for one stream
#[derive(Debug)]
pub struct CaptureTask {
    buffer: CaptureBuffer,
    handle: JoinHandle<io::Result<()>>,
}

/// Spawn a capture task for an optional pipe
pub fn spawn_capture<R>(reader: Option<R>, limit: usize) -> CaptureTask
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = CaptureBuffer::default();
    let sink = buffer.clone();
    let handle = tokio::spawn(async move {
        match reader {
            Some(reader) => capture(reader, limit, &sink).await,
            None => Ok(()),
        }
    });
    CaptureTask { buffer, handle }
}

/// Join a capture task, giving up after `grace`
///
/// The pipe stays open while any process holding it lives, which can outlast
/// the group if a descendant moved itself elsewhere. What was read until then
/// is kept and marked truncated.
pub async fn collect(stream: &str, task: CaptureTask, grace: Duration) -> Captured {
    let CaptureTask { buffer, handle } = task;
    let abort = handle.abort_handle();
    let finished = match tokio::time::timeout(grace, handle).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            warn!("Failed to read {}: {}", stream, e);
            true
        }
        Ok(Err(e)) => {
            warn!("{} reader task failed: {}", stream, e);
            true
        }
        Err(_) => {
            warn!("{} still open {:?} after exit, keeping what was read", stream, grace);
            abort.abort();
            false
        }
    };

    let mut captured = buffer.take();
    if !finished {
        captured.truncated = true;
    }
    captured
}
