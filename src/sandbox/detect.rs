use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::policy::SandboxLevel;
use super::request::BackendKind;

/// Detected kernel sandbox capabilities of the current platform.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxCapabilities {
    /// Landlock LSM ABI version (Linux only).
    pub landlock_abi: Option<u32>,

    /// Whether seccomp-bpf is available (Linux only).
    pub seccomp_available: bool,

    /// The highest enforcement level available.
    pub level: SandboxLevel,
}

/// Probe the current system for sandbox capabilities.
pub fn detect_capabilities() -> SandboxCapabilities {
    #[cfg(target_os = "linux")]
    {
        detect_linux()
    }

    #[cfg(not(target_os = "linux"))]
    {
        SandboxCapabilities {
            landlock_abi: None,
            seccomp_available: false,
            level: SandboxLevel::None,
        }
    }
}

#[cfg(target_os = "linux")]
fn detect_linux() -> SandboxCapabilities {
    let landlock_abi = probe_landlock_abi();
    let seccomp_available = probe_seccomp();

    let level = match (landlock_abi, seccomp_available) {
        (Some(abi), true) if abi >= 4 => SandboxLevel::Full,
        (Some(_), true) => SandboxLevel::Standard,
        (None, true) => SandboxLevel::Minimal,
        _ => SandboxLevel::None,
    };

    SandboxCapabilities {
        landlock_abi,
        seccomp_available,
        level,
    }
}

#[cfg(target_os = "linux")]
fn probe_landlock_abi() -> Option<u32> {
    use landlock::{ABI, Access, AccessFs, Ruleset, RulesetAttr};

    for (abi, version) in [
        (ABI::V5, 5u32),
        (ABI::V4, 4),
        (ABI::V3, 3),
        (ABI::V2, 2),
        (ABI::V1, 1),
    ] {
        if Ruleset::default()
            .handle_access(AccessFs::from_all(abi))
            .is_ok()
        {
            return Some(version);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn probe_seccomp() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|s| s.contains("Seccomp:"))
        .unwrap_or(false)
}

impl SandboxCapabilities {
    /// Resolve the effective level given the configured `sandbox.level`.
    pub fn effective_level(&self, config_level: &str) -> SandboxLevel {
        let requested = match config_level {
            "full" => SandboxLevel::Full,
            "standard" => SandboxLevel::Standard,
            "minimal" => SandboxLevel::Minimal,
            "none" => return SandboxLevel::None,
            // "auto" or anything else: use the highest available
            _ => return self.level,
        };
        requested.min(self.level)
    }

    /// Human-readable status lines for `agentbox status`.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        #[cfg(target_os = "linux")]
        {
            if let Some(abi) = self.landlock_abi {
                lines.push(format!("  Landlock:  v{:<3}                    ok", abi));
            } else {
                lines.push("  Landlock:  not available           --".to_string());
            }

            if self.seccomp_available {
                lines.push("  Seccomp:   available               ok".to_string());
            } else {
                lines.push("  Seccomp:   not available           --".to_string());
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            lines.push("  Kernel:    no sandbox support      --".to_string());
        }

        lines.push(format!("  Level:     {:?}", self.level));
        lines
    }
}

/// Which isolation backends can run on this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendAvailability {
    pub process: bool,
    pub managed_environment: bool,
    pub container: bool,
}

impl BackendAvailability {
    pub fn all() -> Self {
        Self {
            process: true,
            managed_environment: true,
            container: true,
        }
    }

    pub fn process_only() -> Self {
        Self {
            process: true,
            managed_environment: false,
            container: false,
        }
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Process => self.process,
            BackendKind::ManagedEnvironment => self.managed_environment,
            BackendKind::Container => self.container,
        }
    }

    pub fn set(&mut self, kind: BackendKind, available: bool) {
        match kind {
            BackendKind::Process => self.process = available,
            BackendKind::ManagedEnvironment => self.managed_environment = available,
            BackendKind::Container => self.container = available,
        }
    }
}

/// Ask the container runtime for its server version.
///
/// Returns `None` when the binary is missing, the daemon is unreachable,
/// or it does not answer within five seconds.
pub async fn probe_container_runtime(runtime: &str) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(runtime)
            .args(["info", "--format", "{{.ServerVersion}}"])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match output {
        Ok(Ok(out)) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            debug!("{} server version {}", runtime, version);
            Some(version)
        }
        Ok(Ok(out)) => {
            debug!(
                "{} info failed: {}",
                runtime,
                String::from_utf8_lossy(&out.stderr).trim()
            );
            None
        }
        Ok(Err(e)) => {
            debug!("{} not runnable: {}", runtime, e);
            None
        }
        Err(_) => {
            debug!("{} info timed out", runtime);
            None
        }
    }
}
