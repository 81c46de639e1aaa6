use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::Paths;
use crate::sandbox::{SecurityMode, default_shell_allowlist};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// "permissive" (development) or "strict" (production)
    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Kernel sandbox level for the process backend:
    /// "auto" | "full" | "standard" | "minimal" | "none"
    #[serde(default = "default_sandbox_level")]
    pub level: String,

    /// Deadline applied when a request does not carry one (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Output ceiling per stream (default: 1MB)
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// Memory ceiling (RLIMIT_DATA / container --memory, default: 512MB)
    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: u64,

    /// RLIMIT_FSIZE in bytes (default: 50MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// RLIMIT_NPROC (default: 64)
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    /// RLIMIT_NOFILE (default: 256)
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,

    /// Base directory for session workspaces (default: data_dir/workspaces)
    #[serde(default)]
    pub workspace_root: Option<String>,

    /// Move workspaces to `.archive/` on cleanup instead of deleting them
    #[serde(default)]
    pub archive_on_cleanup: bool,

    /// Shell commands that do not raise the risk level on their own
    #[serde(default = "default_shell_allowlist")]
    pub shell_allowlist: Vec<String>,

    /// How long session cleanup waits for a cancelled execution (default: 5)
    #[serde(default = "default_lease_release_grace")]
    pub lease_release_grace_secs: u64,

    /// Let process-backend code open sockets (default: false)
    #[serde(default)]
    pub allow_network: bool,

    /// Additional path allowances for the kernel sandbox
    #[serde(default)]
    pub allow_paths: AllowPathsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowPathsConfig {
    /// Additional read-only paths
    #[serde(default)]
    pub read: Vec<String>,

    /// Additional writable paths
    #[serde(default)]
    pub write: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Container CLI binary (docker, podman)
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// `--network` value; "none" disables egress
    #[serde(default = "default_network")]
    pub network: String,

    /// CPU share as a percentage of one core (default: 100)
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: u32,

    /// `--pids-limit` (default: 128)
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    #[serde(default)]
    pub images: ContainerImages,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerImages {
    #[serde(default = "default_python_image")]
    pub python: String,

    #[serde(default = "default_shell_image")]
    pub shell: String,

    #[serde(default = "default_javascript_image")]
    pub javascript: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum live managed environments (default: 4)
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,

    /// Idle environments older than this are reaped (default: 600)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// First retry delay when the pool is exhausted (default: 100)
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Image for managed environments; must provide python3, bash and node
    #[serde(default = "default_pool_image")]
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// How long a high-risk request waits for a decision (default: 300)
    #[serde(default = "default_confirmation_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}
fn default_sandbox_level() -> String {
    "auto".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_output() -> usize {
    1024 * 1024
}
fn default_max_memory() -> u64 {
    512 * 1024 * 1024
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_max_processes() -> u32 {
    64
}
fn default_max_open_files() -> u64 {
    256
}
fn default_lease_release_grace() -> u64 {
    5
}
fn default_runtime() -> String {
    "docker".to_string()
}
fn default_network() -> String {
    "none".to_string()
}
fn default_cpu_percent() -> u32 {
    100
}
fn default_pids_limit() -> u32 {
    128
}
fn default_python_image() -> String {
    "python:3.12-slim".to_string()
}
fn default_shell_image() -> String {
    "bash:5.2".to_string()
}
fn default_javascript_image() -> String {
    "node:20-slim".to_string()
}
fn default_pool_max_size() -> usize {
    4
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_reap_interval() -> u64 {
    60
}
fn default_backoff_initial() -> u64 {
    100
}
fn default_backoff_max() -> u64 {
    2000
}
fn default_pool_image() -> String {
    "nikolaik/python-nodejs:python3.12-nodejs20-slim".to_string()
}
fn default_confirmation_timeout() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::default(),
            level: default_sandbox_level(),
            default_timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output(),
            max_memory_bytes: default_max_memory(),
            max_file_size_bytes: default_max_file_size(),
            max_processes: default_max_processes(),
            max_open_files: default_max_open_files(),
            workspace_root: None,
            archive_on_cleanup: false,
            shell_allowlist: default_shell_allowlist(),
            lease_release_grace_secs: default_lease_release_grace(),
            allow_network: false,
            allow_paths: AllowPathsConfig::default(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime: default_runtime(),
            network: default_network(),
            cpu_percent: default_cpu_percent(),
            pids_limit: default_pids_limit(),
            images: ContainerImages::default(),
        }
    }
}

impl Default for ContainerImages {
    fn default() -> Self {
        Self {
            python: default_python_image(),
            shell: default_shell_image(),
            javascript: default_javascript_image(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_pool_max_size(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            image: default_pool_image(),
        }
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_confirmation_timeout(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl SandboxConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn lease_release_grace(&self) -> Duration {
        Duration::from_secs(self.lease_release_grace_secs)
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl ConfirmationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mut config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            config.paths = paths;
            config
        } else {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            config
        };

        config.apply_env_overrides(|key| std::env::var(key))?;
        Ok(config)
    }

    /// Apply deployment overrides from the environment.
    pub fn apply_env_overrides<F>(&mut self, env_fn: F) -> Result<()>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        if let Ok(mode) = env_fn("AGENTBOX_SECURITY_MODE")
            && !mode.trim().is_empty()
        {
            self.sandbox.security_mode = mode
                .parse()
                .with_context(|| format!("Invalid AGENTBOX_SECURITY_MODE '{}'", mode))?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Base directory of all session workspaces.
    pub fn workspaces_root(&self) -> PathBuf {
        match self.sandbox.workspace_root {
            Some(ref root) if !root.trim().is_empty() => {
                PathBuf::from(shellexpand::tilde(root.trim()).to_string())
            }
            _ => self.paths.workspaces.clone(),
        }
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.workspaces_root().join(".archive")
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "security_mode"] => Ok(serde_plain(&self.sandbox.security_mode)),
            ["sandbox", "level"] => Ok(self.sandbox.level.clone()),
            ["sandbox", "default_timeout_secs"] => Ok(self.sandbox.default_timeout_secs.to_string()),
            ["sandbox", "max_output_bytes"] => Ok(self.sandbox.max_output_bytes.to_string()),
            ["sandbox", "max_memory_bytes"] => Ok(self.sandbox.max_memory_bytes.to_string()),
            ["sandbox", "workspace_root"] => Ok(self.workspaces_root().display().to_string()),
            ["sandbox", "archive_on_cleanup"] => Ok(self.sandbox.archive_on_cleanup.to_string()),
            ["container", "enabled"] => Ok(self.container.enabled.to_string()),
            ["container", "runtime"] => Ok(self.container.runtime.clone()),
            ["container", "network"] => Ok(self.container.network.clone()),
            ["pool", "enabled"] => Ok(self.pool.enabled.to_string()),
            ["pool", "max_size"] => Ok(self.pool.max_size.to_string()),
            ["pool", "idle_timeout_secs"] => Ok(self.pool.idle_timeout_secs.to_string()),
            ["pool", "image"] => Ok(self.pool.image.clone()),
            ["confirmation", "timeout_secs"] => Ok(self.confirmation.timeout_secs.to_string()),
            ["audit", "enabled"] => Ok(self.audit.enabled.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "json"] => Ok(self.logging.json.to_string()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["sandbox", "security_mode"] => self.sandbox.security_mode = value.parse()?,
            ["sandbox", "level"] => match value {
                "auto" | "full" | "standard" | "minimal" | "none" => {
                    self.sandbox.level = value.to_string()
                }
                _ => anyhow::bail!("Invalid sandbox level: {}", value),
            },
            ["sandbox", "default_timeout_secs"] => self.sandbox.default_timeout_secs = value.parse()?,
            ["sandbox", "max_output_bytes"] => self.sandbox.max_output_bytes = value.parse()?,
            ["sandbox", "max_memory_bytes"] => self.sandbox.max_memory_bytes = value.parse()?,
            ["sandbox", "workspace_root"] => self.sandbox.workspace_root = Some(value.to_string()),
            ["sandbox", "archive_on_cleanup"] => self.sandbox.archive_on_cleanup = value.parse()?,
            ["container", "enabled"] => self.container.enabled = value.parse()?,
            ["container", "runtime"] => self.container.runtime = value.to_string(),
            ["container", "network"] => self.container.network = value.to_string(),
            ["pool", "enabled"] => self.pool.enabled = value.parse()?,
            ["pool", "max_size"] => self.pool.max_size = value.parse()?,
            ["pool", "idle_timeout_secs"] => self.pool.idle_timeout_secs = value.parse()?,
            ["pool", "image"] => self.pool.image = value.to_string(),
            ["confirmation", "timeout_secs"] => self.confirmation.timeout_secs = value.parse()?,
            ["audit", "enabled"] => self.audit.enabled = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "json"] => self.logging.json = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

/// Render a unit-variant enum the way serde names it.
fn serde_plain<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# agentbox configuration
# Auto-created on first run. Edit as needed.

[sandbox]
# "permissive" (development) or "strict" (production).
# Override per deployment with AGENTBOX_SECURITY_MODE.
security_mode = "permissive"
# Kernel isolation for the process backend: auto | full | standard | minimal | none
level = "auto"
default_timeout_secs = 30
max_output_bytes = 1048576            # per stream
max_memory_bytes = 536870912          # 512MB
# max_file_size_bytes = 52428800      # RLIMIT_FSIZE, 50MB
# max_processes = 64                  # RLIMIT_NPROC
# max_open_files = 256                # RLIMIT_NOFILE
# workspace_root = "~/.local/share/agentbox/workspaces"
archive_on_cleanup = false
# lease_release_grace_secs = 5
# shell_allowlist = ["echo", "cat", "ls", "grep"]
# allow_network = false               # seccomp socket deny for the process backend
#
# [sandbox.allow_paths]
# read = ["/data/datasets"]           # additional read-only paths
# write = ["/tmp/builds"]             # additional writable paths

[container]
enabled = true
runtime = "docker"
network = "none"
cpu_percent = 100
pids_limit = 128

[container.images]
python = "python:3.12-slim"
shell = "bash:5.2"
javascript = "node:20-slim"

[pool]
enabled = true
max_size = 4
idle_timeout_secs = 600
reap_interval_secs = 60
# backoff_initial_ms = 100
# backoff_max_ms = 2000
image = "nikolaik/python-nodejs:python3.12-nodejs20-slim"

[confirmation]
timeout_secs = 300

[audit]
enabled = true

[logging]
level = "info"
json = false
"#;
