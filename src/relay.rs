//! Response bodies that own the resource they are reading from.
//!
//! A [`Guarded`] stream keeps its guard alive exactly as long as the HTTP
//! body: hyper drops the body when the transfer finishes or the client goes
//! away, and the guard's `Drop` then releases the temp file or stops the
//! extractor process. The reader is dropped before the guard, so pipes and
//! file handles are already closed when cleanup runs.

use std::{
    io,
    pin::Pin,
    process::ExitStatus,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::Stream;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill, killpg},
    unistd::Pid,
};
use tokio::{process::Child, runtime::Handle, time::timeout};
use tracing::{debug, warn};

use crate::artifact::TempArtifact;

/// How long a process gets to exit after SIGTERM (or after its output ended)
/// before it is killed outright.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Resource tied to a response body.
pub trait BodyGuard {
    /// Called once when the inner stream reports end-of-stream.
    fn complete(&mut self) {}
}

impl BodyGuard for TempArtifact {
    fn complete(&mut self) {
        self.release();
    }
}

pub struct Guarded<S, G: BodyGuard> {
    inner: S,
    guard: G,
    done: bool,
}

impl<S, G: BodyGuard> Guarded<S, G> {
    pub fn new(inner: S, guard: G) -> Self {
        Self {
            inner,
            guard,
            done: false,
        }
    }

    pub fn guard(&self) -> &G {
        &self.guard
    }

    pub fn into_parts(self) -> (S, G) {
        (self.inner, self.guard)
    }
}

impl<S, G> Stream for Guarded<S, G>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
    G: BodyGuard + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                if !this.done {
                    this.done = true;
                    this.guard.complete();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// Owns a spawned child and, optionally, the temp file it writes into.
///
/// Dropping the guard stops the child's whole process group, reaps the
/// leader, and only then releases the artifact, so helpers such as ffmpeg
/// cannot recreate a file after it was removed.
pub struct ProcessGuard {
    child: Option<Child>,
    pgid: Option<i32>,
    artifact: Option<TempArtifact>,
    label: String,
    exhausted: bool,
}

impl ProcessGuard {
    pub fn new(child: Child, label: impl Into<String>) -> Self {
        let pgid = child.id().and_then(|id| i32::try_from(id).ok());
        Self {
            child: Some(child),
            pgid,
            artifact: None,
            label: label.into(),
            exhausted: false,
        }
    }

    /// Ties `artifact` to the process: it is released after the process
    /// group is gone, never before.
    pub fn with_artifact(mut self, artifact: TempArtifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Hands the artifact back once the process has been reaped.
    pub fn take_artifact(&mut self) -> Option<TempArtifact> {
        if self.child.is_some() {
            return None;
        }
        self.artifact.take()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Waits for the leader to exit on its own and kills anything left in its
    /// group. Cancel-safe: if the future is dropped the guard still owns the
    /// child.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let Some(child) = self.child.as_mut() else {
            return Err(io::Error::other("process already reaped"));
        };
        let status = child.wait().await?;
        self.child = None;
        if let Some(pgid) = self.pgid {
            signal_group(pgid, Signal::SIGKILL, &self.label);
        }
        Ok(status)
    }
}

impl BodyGuard for ProcessGuard {
    fn complete(&mut self) {
        self.exhausted = true;
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let artifact = self.artifact.take();
        let Some(mut child) = self.child.take() else {
            drop(artifact);
            return;
        };
        let label = std::mem::take(&mut self.label);
        let exhausted = self.exhausted;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shut_down(&mut child, &label, exhausted).await;
                    drop(artifact);
                });
            }
            // No runtime left to reap on; SIGKILL is the best we can do.
            Err(_) => {
                if let Some(pgid) = self.pgid {
                    signal_group(pgid, Signal::SIGKILL, &label);
                }
                if let Err(err) = child.start_kill() {
                    warn!("{label}: could not kill process: {err}");
                }
                drop(artifact);
            }
        }
    }
}

/// Stops `child` and everything in its process group, then reaps it. When
/// its output was fully consumed the process is first given
/// [`TERMINATE_GRACE`] to exit on its own.
pub async fn shut_down(child: &mut Child, label: &str, exhausted: bool) {
    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        debug!("{label}: already reaped");
        return;
    };

    if exhausted {
        match timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) if status.success() => debug!("{label}: exited cleanly"),
            Ok(Ok(status)) => {
                warn!("{label}: exited with {status}, relayed output may be truncated")
            }
            Ok(Err(err)) => warn!("{label}: wait failed: {err}"),
            Err(_) => debug!("{label}: still running after end of output"),
        }
    }

    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("{label}: exited with {status}");
            signal_group(pid, Signal::SIGKILL, label);
            return;
        }
        Ok(None) => {}
        Err(err) => warn!("{label}: could not poll process: {err}"),
    }

    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM)
        && err != Errno::ESRCH
    {
        debug!("{label}: SIGTERM failed: {err}");
    }
    signal_group(pid, Signal::SIGTERM, label);

    match timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("{label}: stopped with {status}"),
        Ok(Err(err)) => warn!("{label}: wait after SIGTERM failed: {err}"),
        Err(_) => {
            warn!("{label}: ignored SIGTERM, killing");
            if let Err(err) = child.kill().await {
                warn!("{label}: kill failed: {err}");
            }
        }
    }
    signal_group(pid, Signal::SIGKILL, label);
}

/// Signals the process group led by `pgid`. A group that no longer exists is
/// not an error.
fn signal_group(pgid: i32, signal: Signal, label: &str) {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => debug!("{label}: {signal} to group {pgid} failed: {err}"),
    }
}
