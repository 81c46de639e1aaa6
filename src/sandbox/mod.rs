//! Sandboxed code execution for agent-generated programs.
//!
//! A [`SandboxManager`] classifies each request with the [`RiskPolicy`],
//! gates high-risk code behind a [`ConfirmationService`] in strict mode,
//! and runs it on the most isolating eligible backend:
//!
//! - `process`: a local child process in its own process group with rlimits,
//!   plus Landlock and seccomp on Linux via the argv[0] re-exec pattern
//!   (the binary re-executes itself as `agentbox-sandbox`).
//! - `managed-environment`: a long-lived container bound to the session,
//!   drawn from the [`BackendPool`].
//! - `container`: a disposable, hardened container per execution.

pub mod child;
pub mod confirm;
pub mod detect;
pub mod executor;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod manager;
pub mod output;
pub mod policy;
pub mod pool;
pub mod request;
pub mod risk;
pub mod workspace;

pub use child::sandbox_child_main;
pub use confirm::{
    ConfirmationPrompt, ConfirmationService, Decision, NotificationChannel, PendingPrompts,
};
pub use detect::{
    BackendAvailability, SandboxCapabilities, detect_capabilities, probe_container_runtime,
};
pub use executor::{ContainerExecutor, Executor, ManagedExecutor, ProcessExecutor};
pub use manager::{HealthReport, SandboxManager, select_backends};
pub use output::{CapturedOutput, OutputCapture};
pub use policy::{NetworkPolicy, ResourceLimits, SandboxLevel, SandboxPolicy, build_policy};
pub use pool::{BackendPool, DockerEnvironmentProvider, EnvironmentProvider, PoolStats};
pub use request::{BackendKind, ExecutionRequest, ExecutionResult, Language, SessionScope};
pub use risk::{
    RiskAssessment, RiskCategory, RiskIndicator, RiskLevel, RiskPolicy, SecurityMode,
    default_shell_allowlist,
};
pub use workspace::Workspace;
