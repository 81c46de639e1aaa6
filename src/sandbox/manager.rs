//! Sandbox manager: the single entry point for running untrusted code.
//!
//! One call to [`SandboxManager::execute`] validates the request, takes the
//! session lease, classifies risk, gets confirmation when the mode demands
//! it, picks a backend and runs the code under a hard deadline. Failures
//! before the code reaches a backend come back as `Err`; once a backend has
//! been invoked the outcome is always a normalized [`ExecutionResult`]
//! carrying whatever output was captured.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::concurrency::{SessionLease, SessionLeases};
use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::security::{AuditAction, AuditLog};

use super::confirm::{ConfirmationService, Decision};
use super::detect::{BackendAvailability, detect_capabilities, probe_container_runtime};
use super::executor::{ContainerExecutor, Executor, ManagedExecutor, ProcessExecutor};
use super::output::{CapturedOutput, OutputCapture};
use super::pool::{BackendPool, DockerEnvironmentProvider, PoolStats};
use super::request::{BackendKind, ExecutionRequest, ExecutionResult, SessionScope};
use super::risk::{RiskAssessment, RiskLevel, RiskPolicy, SecurityMode};
use super::workspace::Workspace;

/// Serializable snapshot for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub security_mode: SecurityMode,
    pub active_sessions: usize,
    pub open_workspaces: usize,
    pub pending_confirmations: usize,
    pub backends: BackendAvailability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

enum Outcome {
    Finished(Result<i32>),
    TimedOut,
    Cancelled,
}

pub struct SandboxManager {
    policy: RiskPolicy,
    executors: Vec<Arc<dyn Executor>>,
    availability: BackendAvailability,
    leases: SessionLeases,
    workspaces_root: PathBuf,
    archive_dir: PathBuf,
    archive_on_cleanup: bool,
    lease_release_grace: Duration,
    max_memory_bytes: u64,
    max_output_bytes: usize,
    confirmation: Option<ConfirmationService>,
    audit: AuditLog,
    open_workspaces: Mutex<HashMap<SessionScope, Workspace>>,
    pool: Option<BackendPool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxManager {
    /// Manager over the given executors. A backend is available exactly
    /// when one of them implements it.
    pub fn new(config: &Config, executors: Vec<Arc<dyn Executor>>) -> Self {
        let mut availability = BackendAvailability::default();
        for executor in &executors {
            availability.set(executor.kind(), true);
        }

        Self {
            policy: RiskPolicy::from_config(&config.sandbox),
            executors,
            availability,
            leases: SessionLeases::new(),
            workspaces_root: config.workspaces_root(),
            archive_dir: config.archive_dir(),
            archive_on_cleanup: config.sandbox.archive_on_cleanup,
            lease_release_grace: config.sandbox.lease_release_grace(),
            max_memory_bytes: config.sandbox.max_memory_bytes,
            max_output_bytes: config.sandbox.max_output_bytes,
            confirmation: None,
            audit: AuditLog::disabled(),
            open_workspaces: Mutex::new(HashMap::new()),
            pool: None,
            reaper: Mutex::new(None),
        }
    }

    /// Build every backend this host supports: the process backend always,
    /// container and managed environments when the container runtime answers.
    pub async fn from_config(config: &Config) -> Self {
        let capabilities = detect_capabilities();
        let level = capabilities.effective_level(&config.sandbox.level);
        info!("Kernel sandbox level: {:?}", level);

        let mut executors: Vec<Arc<dyn Executor>> =
            vec![Arc::new(ProcessExecutor::new(config.sandbox.clone(), level))];

        let runtime_version = if config.container.enabled || config.pool.enabled {
            probe_container_runtime(&config.container.runtime).await
        } else {
            None
        };
        match runtime_version {
            Some(ref version) => info!("{} {} available", config.container.runtime, version),
            None => debug!("Container runtime unavailable, container backends disabled"),
        }

        if config.container.enabled && runtime_version.is_some() {
            executors.push(Arc::new(ContainerExecutor::new(config.container.clone())));
        }

        let mut pool = None;
        if config.pool.enabled && runtime_version.is_some() {
            let provider = Arc::new(DockerEnvironmentProvider::new(
                config.container.clone(),
                &config.pool,
                config.sandbox.max_memory_bytes,
            ));
            let backend_pool = BackendPool::from_config(provider, &config.pool);
            executors.push(Arc::new(ManagedExecutor::new(backend_pool.clone(), &config.pool)));
            pool = Some(backend_pool);
        }

        let audit = if config.audit.enabled {
            AuditLog::new(&config.paths.state_dir)
        } else {
            AuditLog::disabled()
        };

        let mut manager = Self::new(config, executors).with_audit(audit);
        if let Some(pool) = pool {
            manager = manager.with_pool(pool, config.pool.reap_interval());
        }
        manager
    }

    pub fn with_confirmation(mut self, service: ConfirmationService) -> Self {
        self.confirmation = Some(service);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Report `pool` in health checks and reap it every `reap_interval`.
    pub fn with_pool(mut self, pool: BackendPool, reap_interval: Duration) -> Self {
        let reaper = pool.spawn_reaper(reap_interval);
        *self.reaper.get_mut().unwrap_or_else(|p| p.into_inner()) = Some(reaper);
        self.pool = Some(pool);
        self
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn availability(&self) -> BackendAvailability {
        self.availability
    }

    pub fn confirmation(&self) -> Option<&ConfirmationService> {
        self.confirmation.as_ref()
    }

    fn executor(&self, kind: BackendKind) -> Option<&Arc<dyn Executor>> {
        self.executors.iter().find(|e| e.kind() == kind)
    }

    fn workspaces(&self) -> MutexGuard<'_, HashMap<SessionScope, Workspace>> {
        self.open_workspaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        request.validate()?;
        let request = ExecutionRequest {
            memory_limit_bytes: request.memory_limit_bytes.min(self.max_memory_bytes),
            output_limit_bytes: request.output_limit_bytes.min(self.max_output_bytes),
            ..request
        };
        let session_id = request.session_id().to_string();

        let lease = match self.leases.try_acquire(&session_id) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(session = %session_id, "Rejected concurrent execution");
                self.audit
                    .record(AuditAction::ConcurrentAccessDenied, &session_id, None);
                return Err(e);
            }
        };

        let assessment = self.policy.assess(&request);
        debug!(
            session = %session_id,
            language = %request.language,
            "Assessed request: {}",
            assessment.summary()
        );

        if let Some(ref reason) = assessment.forbidden {
            warn!(session = %session_id, "Execution rejected: {}", reason);
            self.audit.record_code(
                AuditAction::ExecutionRejected,
                &session_id,
                &request.code,
                Some(reason.as_str()),
            );
            return Err(SandboxError::ExecutionRejected(reason.clone()));
        }

        if assessment.requires_confirmation {
            tokio::select! {
                confirmed = self.confirm(&request, &assessment) => confirmed?,
                _ = lease.cancelled() => {
                    return Err(SandboxError::Cancelled("session cleaned up while awaiting confirmation".into()));
                }
            }
        }

        let candidates = select_backends(&assessment, &self.availability, request.backend)?;
        let workspace = self.open_workspace(&request.scope)?;

        if assessment.level == RiskLevel::High {
            self.audit.record_code(
                AuditAction::HighRiskExecution,
                &session_id,
                &request.code,
                Some(assessment.summary().as_str()),
            );
        }

        let before = workspace.snapshot()?;
        let mut result = self
            .run(&request, &assessment, &workspace, &lease, &candidates)
            .await;
        match workspace.snapshot() {
            Ok(after) => result.created_files = after.difference(&before).cloned().collect(),
            Err(e) => warn!(session = %session_id, "Workspace snapshot failed: {}", e),
        }

        info!(
            session = %session_id,
            backend = ?result.backend,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "Execution finished (success: {})",
            result.success
        );
        Ok(result)
    }

    async fn confirm(&self, request: &ExecutionRequest, assessment: &RiskAssessment) -> Result<()> {
        let session_id = request.session_id();
        let summary = assessment.summary();

        let Some(ref service) = self.confirmation else {
            warn!(session = %session_id, "Confirmation required but no channel is configured");
            self.audit.record_code(
                AuditAction::ConfirmationRejected,
                session_id,
                &request.code,
                Some("no confirmation channel"),
            );
            return Err(SandboxError::ConfirmationRejected);
        };

        self.audit.record_code(
            AuditAction::ConfirmationRequested,
            session_id,
            &request.code,
            Some(summary.as_str()),
        );
        let description = format!("{} ({}):\n{}", request.language, summary, request.code);
        let decision = service
            .request_confirmation(session_id, &description, assessment)
            .await?;

        match decision {
            Decision::Approved => {
                info!(session = %session_id, "Execution approved");
                self.audit
                    .record(AuditAction::ConfirmationApproved, session_id, None);
                Ok(())
            }
            Decision::Rejected => {
                info!(session = %session_id, "Execution rejected by reviewer");
                self.audit
                    .record(AuditAction::ConfirmationRejected, session_id, None);
                Err(SandboxError::ConfirmationRejected)
            }
            Decision::TimedOut => {
                warn!(session = %session_id, "Confirmation timed out");
                self.audit
                    .record(AuditAction::ConfirmationTimedOut, session_id, None);
                Err(SandboxError::ConfirmationTimeout)
            }
        }
    }

    fn open_workspace(&self, scope: &SessionScope) -> Result<Workspace> {
        let mut open = self.workspaces();
        if let Some(workspace) = open.get(scope) {
            return Ok(workspace.clone());
        }
        let workspace =
            Workspace::create(&self.workspaces_root, scope)?.with_audit(self.audit.clone());
        open.insert(scope.clone(), workspace.clone());
        Ok(workspace)
    }

    /// Try `candidates` in order under one shared deadline. Moving to the
    /// next candidate only happens in permissive mode, and only when a
    /// backend turns out to be unavailable.
    async fn run(
        &self,
        request: &ExecutionRequest,
        assessment: &RiskAssessment,
        workspace: &Workspace,
        lease: &SessionLease,
        candidates: &[BackendKind],
    ) -> ExecutionResult {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + request.timeout;
        let may_fall_back = self.policy.mode() == SecurityMode::Permissive;
        let session_id = request.session_id();

        for (i, &backend) in candidates.iter().enumerate() {
            let Some(executor) = self.executor(backend) else {
                continue;
            };
            debug!(session = %session_id, %backend, "Selected backend");

            let capture = OutputCapture::new(request.output_limit_bytes);
            let outcome = tokio::select! {
                finished = tokio::time::timeout_at(deadline, executor.execute(request, workspace, &capture)) => {
                    match finished {
                        Ok(result) => Outcome::Finished(result),
                        Err(_) => Outcome::TimedOut,
                    }
                }
                _ = lease.cancelled() => Outcome::Cancelled,
            };
            let output = capture.snapshot();

            let error = match outcome {
                Outcome::Finished(Ok(exit_code)) => {
                    return completed(exit_code, output, backend, assessment.level, started);
                }
                Outcome::Finished(Err(e @ SandboxError::SandboxNotAvailable { .. }))
                    if may_fall_back && i + 1 < candidates.len() =>
                {
                    warn!(session = %session_id, "{}; falling back to {}", e, candidates[i + 1]);
                    continue;
                }
                Outcome::Finished(Err(e)) => {
                    warn!(session = %session_id, %backend, "Execution failed: {}", e);
                    e
                }
                Outcome::TimedOut => {
                    let timeout_ms = request.timeout.as_millis() as u64;
                    warn!(session = %session_id, %backend, "Execution exceeded {}ms, killed", timeout_ms);
                    self.audit
                        .record(AuditAction::ExecutionTimedOut, session_id, Some(backend.as_str()));
                    SandboxError::SandboxTimeout { timeout_ms }
                }
                Outcome::Cancelled => {
                    info!(session = %session_id, "Execution cancelled by session cleanup");
                    self.audit
                        .record(AuditAction::ExecutionCancelled, session_id, Some(backend.as_str()));
                    SandboxError::Cancelled("session cleaned up".into())
                }
            };
            return failed(&error, output, backend, assessment.level, started);
        }

        let mut result = ExecutionResult::from_error(&SandboxError::NoEligibleBackend {
            level: assessment.level,
        });
        result.risk_level = Some(assessment.level);
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Interrupt the session's execution (bounded wait), then release its
    /// managed environment and tear down or archive its workspaces.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<()> {
        if self.leases.cancel(session_id) {
            info!("Cancelling in-flight execution of session {}", session_id);
            if !self
                .leases
                .wait_released(session_id, self.lease_release_grace)
                .await
            {
                warn!(
                    "Session {} still busy after {:?}, leaving it in place",
                    session_id, self.lease_release_grace
                );
            }
        }

        // Held until teardown is done, so no execution can start in a
        // workspace that is being removed.
        let _lease = self.leases.try_acquire(session_id)?;

        for executor in &self.executors {
            if let Err(e) = executor.release_session(session_id).await {
                warn!("{} backend failed to release session {}: {}", executor.kind(), session_id, e);
            }
        }

        let workspaces: Vec<Workspace> = {
            let mut open = self.workspaces();
            let scopes: Vec<SessionScope> = open
                .keys()
                .filter(|scope| scope.session_id == session_id)
                .cloned()
                .collect();
            scopes.iter().filter_map(|scope| open.remove(scope)).collect()
        };

        for workspace in workspaces {
            if self.archive_on_cleanup {
                let dest = workspace.archive(&self.archive_dir)?;
                info!("Archived workspace of session {} to {}", session_id, dest.display());
            } else {
                workspace.teardown()?;
                debug!("Removed workspace {}", workspace.root().display());
            }
        }
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            security_mode: self.policy.mode(),
            active_sessions: self.leases.active_count(),
            open_workspaces: self.workspaces().len(),
            pending_confirmations: self
                .confirmation
                .as_ref()
                .map_or(0, |c| c.pending().len()),
            backends: self.availability,
            pool: self.pool.as_ref().map(BackendPool::stats),
        }
    }

    /// Stop the reaper and release everything every backend holds.
    pub async fn shutdown(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        for executor in &self.executors {
            if let Err(e) = executor.cleanup().await {
                warn!("{} backend cleanup failed: {}", executor.kind(), e);
            }
        }
    }
}

/// Backends to try, in order.
///
/// The first is the permitted override if one was requested and is
/// available, otherwise the most isolating available eligible backend.
/// The rest are the weaker eligible, available backends, strongest first.
pub fn select_backends(
    assessment: &RiskAssessment,
    availability: &BackendAvailability,
    requested: Option<BackendKind>,
) -> Result<Vec<BackendKind>> {
    let mut eligible: Vec<BackendKind> = assessment
        .eligible_backends
        .iter()
        .copied()
        .filter(|b| availability.is_available(*b))
        .collect();
    eligible.sort_by(|a, b| b.cmp(a));

    let primary = match requested {
        Some(backend) if assessment.permits(backend) && availability.is_available(backend) => {
            Some(backend)
        }
        Some(backend) => {
            warn!(
                "Ignoring backend override {}: not permitted or not available at {} risk",
                backend, assessment.level
            );
            eligible.first().copied()
        }
        None => eligible.first().copied(),
    };

    let Some(primary) = primary else {
        return Err(SandboxError::NoEligibleBackend {
            level: assessment.level,
        });
    };

    let mut order = vec![primary];
    order.extend(eligible.into_iter().filter(|b| *b < primary));
    Ok(order)
}

fn completed(
    exit_code: i32,
    output: CapturedOutput,
    backend: BackendKind,
    level: RiskLevel,
    started: Instant,
) -> ExecutionResult {
    ExecutionResult {
        success: exit_code == 0,
        stdout: output.stdout,
        stderr: output.stderr,
        stdout_truncated: output.stdout_truncated,
        stderr_truncated: output.stderr_truncated,
        exit_code,
        error: None,
        error_code: None,
        backend: Some(backend),
        risk_level: Some(level),
        duration_ms: started.elapsed().as_millis() as u64,
        created_files: Vec::new(),
    }
}

fn failed(
    error: &SandboxError,
    output: CapturedOutput,
    backend: BackendKind,
    level: RiskLevel,
    started: Instant,
) -> ExecutionResult {
    ExecutionResult {
        stdout: output.stdout,
        stderr: output.stderr,
        stdout_truncated: output.stdout_truncated,
        stderr_truncated: output.stderr_truncated,
        backend: Some(backend),
        risk_level: Some(level),
        duration_ms: started.elapsed().as_millis() as u64,
        ..ExecutionResult::from_error(error)
    }
}
