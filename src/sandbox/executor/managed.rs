use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::concurrency::Backoff;
use crate::config::PoolConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::output::OutputCapture;
use crate::sandbox::pool::{BackendPool, EnvironmentLease};
use crate::sandbox::request::{BackendKind, ExecutionRequest};
use crate::sandbox::workspace::Workspace;

use super::{Executor, drive_child, spawn_error};

/// Runs code inside the session's pooled environment.
///
/// State left behind by one call (installed packages, files outside the
/// workspace, running servers) is visible to the next call of the same
/// session.
#[derive(Debug, Clone)]
pub struct ManagedExecutor {
    pool: BackendPool,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl ManagedExecutor {
    pub fn new(pool: BackendPool, config: &PoolConfig) -> Self {
        Self {
            pool,
            backoff_initial: Duration::from_millis(config.backoff_initial_ms.max(1)),
            backoff_max: Duration::from_millis(config.backoff_max_ms.max(1)),
        }
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    /// Acquire with exponential backoff while the pool is exhausted, giving
    /// up once the next wait would pass `deadline`.
    async fn acquire(
        &self,
        request: &ExecutionRequest,
        workspace: &Workspace,
        deadline: Instant,
    ) -> Result<EnvironmentLease> {
        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max, 2);
        loop {
            match self.pool.acquire(request.session_id(), workspace.root()).await {
                Err(SandboxError::PoolExhausted { capacity }) => {
                    let delay = backoff.next_delay();
                    if Instant::now() + delay >= deadline {
                        return Err(SandboxError::PoolExhausted { capacity });
                    }
                    debug!(
                        session = %request.session_id(),
                        attempt = backoff.attempt,
                        "Pool exhausted, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Executor for ManagedExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::ManagedEnvironment
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        workspace: &Workspace,
        capture: &OutputCapture,
    ) -> Result<i32> {
        let deadline = Instant::now() + request.timeout;
        let lease = self.acquire(request, workspace, deadline).await?;

        let mut cmd = self.pool.exec_command(&lease, request.language);
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.pool.release(lease, false).await;
                return Err(spawn_error(BackendKind::ManagedEnvironment, &program, e));
            }
        };
        debug!(
            session = %request.session_id(),
            environment = %lease.env_id(),
            "Executing in managed environment"
        );

        // If this future is dropped here, the unreleased lease takes the
        // environment down with it.
        match drive_child(child, &request.code, capture).await {
            Ok(code) => {
                self.pool.release(lease, true).await;
                Ok(code)
            }
            Err(e) => {
                self.pool.release(lease, false).await;
                Err(e)
            }
        }
    }

    async fn release_session(&self, session_id: &str) -> Result<()> {
        self.pool.release_session(session_id).await;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.pool.shutdown().await;
        Ok(())
    }
}
