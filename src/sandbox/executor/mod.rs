//! Isolation backends.
//!
//! Every backend takes the program on stdin, runs it with the session
//! workspace as its working directory, and streams output into the
//! manager-owned [`OutputCapture`]. Dropping an in-flight `execute` future
//! tears down whatever it started.

mod container;
mod managed;
mod process;

pub use container::ContainerExecutor;
pub(crate) use container::isolation_args;
pub use managed::ManagedExecutor;
pub use process::ProcessExecutor;

use async_trait::async_trait;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::error::{Result, SandboxError};

use super::output::{OutputCapture, Stream};
use super::request::{BackendKind, ExecutionRequest};
use super::workspace::Workspace;

/// How long output pipes may stay open after the program exits
/// (a backgrounded grandchild holding stdout, say).
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run `request.code` in `workspace` and return its exit code.
    async fn execute(
        &self,
        request: &ExecutionRequest,
        workspace: &Workspace,
        capture: &OutputCapture,
    ) -> Result<i32>;

    /// Drop per-session state held by the backend. Idempotent.
    async fn release_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    /// Release everything the backend holds. Idempotent.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Feed `code` to the child's stdin, capture its output, and wait for exit.
pub(crate) async fn drive_child(child: Child, code: &str, capture: &OutputCapture) -> Result<i32> {
    drive_child_with(child, code, capture, async {}).await
}

/// Like [`drive_child`], but the child is only reaped after `before_reap`
/// completes.
pub(crate) async fn drive_child_with(
    mut child: Child,
    code: &str,
    capture: &OutputCapture,
    before_reap: impl Future<Output = ()>,
) -> Result<i32> {
    let stdout = child
        .stdout
        .take()
        .map(|s| tokio::spawn(capture.clone().pump(Stream::Stdout, s)));
    let stderr = child
        .stderr
        .take()
        .map(|s| tokio::spawn(capture.clone().pump(Stream::Stderr, s)));

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // The program may exit without reading all of its input.
            let _ = stdin.write_all(code.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
    };

    let wait = async {
        before_reap.await;
        child.wait().await
    };
    let (_, status) = tokio::join!(feed, wait);
    let status = status?;

    for pump in [stdout, stderr].into_iter().flatten() {
        drain(pump).await;
    }
    Ok(exit_code(status))
}

async fn drain(mut pump: JoinHandle<std::io::Result<()>>) {
    if tokio::time::timeout(DRAIN_GRACE, &mut pump).await.is_err() {
        pump.abort();
    }
}

/// Exit code, or 128 + signal number for a signalled process.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Map a spawn failure: a missing binary means the backend is unavailable.
pub(crate) fn spawn_error(backend: BackendKind, program: &str, err: std::io::Error) -> SandboxError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SandboxError::SandboxNotAvailable {
            backend,
            reason: format!("'{}' not found", program),
        }
    } else {
        SandboxError::Io(format!("failed to start {}: {}", program, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn test_drive_child_feeds_stdin_and_collects_output() {
        let child = tokio::process::Command::new("/bin/sh")
            .arg("-s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let capture = OutputCapture::new(1024);

        let code = drive_child(child, "echo out; echo err >&2; exit 7", &capture)
            .await
            .unwrap();

        assert_eq!(code, 7);
        let out = capture.snapshot();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_drive_child_tolerates_unread_stdin() {
        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let capture = OutputCapture::new(16);
        let big = "x".repeat(1 << 20);

        assert_eq!(drive_child(child, &big, &capture).await.unwrap(), 0);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let err = spawn_error(
            BackendKind::Container,
            "docker",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(
            err,
            SandboxError::SandboxNotAvailable {
                backend: BackendKind::Container,
                ..
            }
        ));

        let err = spawn_error(
            BackendKind::Process,
            "python3",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, SandboxError::Io(_)));
    }
}
