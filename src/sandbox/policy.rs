use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::SandboxConfig;

/// Kernel enforcement level for the process backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    /// No kernel support: rlimits + deadline only.
    None,
    /// seccomp only: network blocking.
    Minimal,
    /// Landlock V1+ + seccomp: filesystem + network isolation.
    Standard,
    /// Landlock V4+ + seccomp.
    Full,
}

/// Network access policy for sandboxed processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    Deny,
    Allow,
}

/// Resource ceilings applied with setrlimit before the interpreter starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// RLIMIT_DATA
    pub max_memory_bytes: u64,
    /// RLIMIT_FSIZE
    pub max_file_size_bytes: u64,
    /// RLIMIT_NPROC (Linux only)
    pub max_processes: u32,
    /// RLIMIT_NOFILE
    pub max_open_files: u64,
}

impl ResourceLimits {
    pub fn from_config(config: &SandboxConfig, memory_limit_bytes: u64) -> Self {
        Self {
            max_memory_bytes: memory_limit_bytes,
            max_file_size_bytes: config.max_file_size_bytes,
            max_processes: config.max_processes,
            max_open_files: config.max_open_files,
        }
    }
}

/// Serializable policy passed to the re-exec'd sandbox child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Session workspace root: read/write.
    pub workspace_path: PathBuf,

    /// System and interpreter directories: read/execute.
    pub read_only_paths: Vec<PathBuf>,

    /// Additional writable paths.
    pub extra_write_paths: Vec<PathBuf>,

    /// Credential directories; never granted.
    pub deny_paths: Vec<PathBuf>,

    pub network: NetworkPolicy,

    pub limits: ResourceLimits,

    pub level: SandboxLevel,
}

fn default_deny_paths() -> Vec<PathBuf> {
    let home = dirs_home();
    vec![
        home.join(".ssh"),
        home.join(".aws"),
        home.join(".gnupg"),
        home.join(".config"),
        home.join(".docker"),
        home.join(".kube"),
        home.join(".npmrc"),
        home.join(".pypirc"),
        home.join(".netrc"),
    ]
}

fn default_read_only_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        [
            "/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc", "/dev", "/proc/self",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }
    #[cfg(not(target_os = "linux"))]
    {
        vec![]
    }
}

/// Interpreter prefixes reachable through `PATH` (e.g. `/opt/conda` for
/// `/opt/conda/bin`), so interpreters outside `/usr` can load their stdlib.
///
/// A prefix that contains or sits inside a denied directory is narrowed to
/// the `PATH` entry itself, or dropped.
fn interpreter_prefixes(path_var: &str, deny: &[PathBuf]) -> Vec<PathBuf> {
    let conflicts = |p: &Path| deny.iter().any(|d| d.starts_with(p) || p.starts_with(d));
    let mut prefixes = Vec::new();
    for dir in std::env::split_paths(path_var).filter(|p| p.is_absolute()) {
        let candidate = match dir.parent() {
            Some(parent) if parent != Path::new("/") && !conflicts(parent) => parent.to_path_buf(),
            _ => dir,
        };
        if !conflicts(&candidate) && !prefixes.contains(&candidate) {
            prefixes.push(candidate);
        }
    }
    prefixes
}

fn dirs_home() -> PathBuf {
    etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("~"))
}

/// Build a `SandboxPolicy` for one execution in `workspace`.
pub fn build_policy(
    config: &SandboxConfig,
    workspace: &Path,
    level: SandboxLevel,
    memory_limit_bytes: u64,
) -> SandboxPolicy {
    let deny_paths = default_deny_paths();

    let mut read_only = default_read_only_paths();
    if let Ok(path_var) = std::env::var("PATH") {
        for prefix in interpreter_prefixes(&path_var, &deny_paths) {
            if !read_only.contains(&prefix) {
                read_only.push(prefix);
            }
        }
    }
    for p in &config.allow_paths.read {
        read_only.push(PathBuf::from(shellexpand::tilde(p).to_string()));
    }

    let mut extra_write = vec![PathBuf::from("/tmp")];
    for p in &config.allow_paths.write {
        extra_write.push(PathBuf::from(shellexpand::tilde(p).to_string()));
    }

    SandboxPolicy {
        workspace_path: workspace.to_path_buf(),
        read_only_paths: read_only,
        extra_write_paths: extra_write,
        deny_paths,
        network: if config.allow_network {
            NetworkPolicy::Allow
        } else {
            NetworkPolicy::Deny
        },
        limits: ResourceLimits::from_config(config, memory_limit_bytes),
        level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_policy_confines_to_workspace() {
        let config = SandboxConfig::default();
        let workspace = PathBuf::from("/srv/ws/org/team/w/s1");
        let policy = build_policy(&config, &workspace, SandboxLevel::Standard, 1 << 20);

        assert_eq!(policy.workspace_path, workspace);
        assert_eq!(policy.network, NetworkPolicy::Deny);
        assert_eq!(policy.level, SandboxLevel::Standard);
        assert_eq!(policy.limits.max_memory_bytes, 1 << 20);
        assert_eq!(policy.limits.max_processes, config.max_processes);
        assert!(policy.extra_write_paths.contains(&PathBuf::from("/tmp")));
    }

    #[test]
    fn test_network_opt_in() {
        let config = SandboxConfig {
            allow_network: true,
            ..SandboxConfig::default()
        };
        let policy = build_policy(&config, Path::new("/tmp/ws"), SandboxLevel::Minimal, 4096);
        assert_eq!(policy.network, NetworkPolicy::Allow);
    }

    #[test]
    fn test_sandbox_level_ordering() {
        assert!(SandboxLevel::None < SandboxLevel::Minimal);
        assert!(SandboxLevel::Minimal < SandboxLevel::Standard);
        assert!(SandboxLevel::Standard < SandboxLevel::Full);
    }

    #[test]
    fn test_policy_serialization_roundtrip() {
        let config = SandboxConfig::default();
        let policy = build_policy(&config, Path::new("/tmp/ws"), SandboxLevel::Minimal, 4096);

        let json = serde_json::to_string(&policy).unwrap();
        let back: SandboxPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workspace_path, policy.workspace_path);
        assert_eq!(back.level, SandboxLevel::Minimal);
        assert_eq!(back.limits, policy.limits);
    }

    #[test]
    fn test_deny_paths_include_credentials() {
        let policy = build_policy(
            &SandboxConfig::default(),
            Path::new("/tmp/ws"),
            SandboxLevel::Standard,
            4096,
        );
        let home = dirs_home();
        let ssh = home.join(".ssh");
        assert!(policy.deny_paths.contains(&ssh));
        assert!(policy.deny_paths.contains(&home.join(".aws")));
        assert!(
            !policy
                .read_only_paths
                .iter()
                .any(|p| p.starts_with(&ssh) || ssh.starts_with(p))
        );
    }

    #[test]
    fn test_interpreter_prefixes() {
        let deny = vec![PathBuf::from("/home/dev/.ssh")];
        let prefixes = interpreter_prefixes(
            "/opt/conda/bin:/bin:relative/bin:/usr/local/bin:/home/dev/bin:/opt/conda/bin",
            &deny,
        );
        assert_eq!(
            prefixes,
            vec![
                PathBuf::from("/opt/conda"),
                PathBuf::from("/bin"),
                PathBuf::from("/usr/local"),
                PathBuf::from("/home/dev/bin"),
            ]
        );
    }
}
