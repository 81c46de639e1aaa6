//! XDG Base Directory compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. agentbox-specific env var (AGENTBOX_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved directory paths for the whole application.
#[derive(Debug, Clone)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    /// Data root: holds the session workspaces
    pub data_dir: PathBuf,

    /// Base of every session workspace tree.
    /// May be overridden independently via AGENTBOX_WORKSPACES.
    pub workspaces: PathBuf,

    /// Audit log and other runtime state
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "AGENTBOX_CONFIG_DIR", || {
            strategy.config_dir().join("agentbox")
        });

        let data_dir = env_or(&env_fn, "AGENTBOX_DATA_DIR", || {
            strategy.data_dir().join("agentbox")
        });

        let state_dir = env_or(&env_fn, "AGENTBOX_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("agentbox")
        });

        let workspaces = resolve_workspaces(&env_fn, &data_dir);

        Ok(Self {
            config_dir,
            data_dir,
            workspaces,
            state_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Audit log: state_dir/agentbox.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        crate::security::audit_file_path(&self.state_dir)
    }

    /// Create all directories with owner-only permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.state_dir,
            &self.workspaces,
        ] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            let data_dir = home.join(".local").join("share").join("agentbox");
            Self {
                config_dir: home.join(".config").join("agentbox"),
                workspaces: data_dir.join("workspaces"),
                data_dir,
                state_dir: home.join(".local").join("state").join("agentbox"),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_workspaces<F>(env_fn: &F, data_dir: &Path) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(ws) = env_fn("AGENTBOX_WORKSPACES") {
        let trimmed = ws.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(shellexpand::tilde(trimmed).to_string());
            if path.is_absolute() {
                return path;
            }
        }
    }
    data_dir.join("workspaces")
}

/// Create a directory with mode 0700.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(paths.config_dir.ends_with("agentbox"), "{:?}", paths.config_dir);
        assert!(paths.data_dir.ends_with("agentbox"), "{:?}", paths.data_dir);
        assert!(paths.state_dir.ends_with("agentbox"), "{:?}", paths.state_dir);
        assert!(paths.workspaces.ends_with("agentbox/workspaces"));
    }

    #[test]
    fn env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("AGENTBOX_CONFIG_DIR", "/custom/config");
        env.insert("AGENTBOX_DATA_DIR", "/custom/data");
        env.insert("AGENTBOX_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(paths.workspaces, PathBuf::from("/custom/data/workspaces"));
    }

    #[test]
    fn relative_and_empty_paths_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("AGENTBOX_CONFIG_DIR", "relative/path");
        env.insert("AGENTBOX_STATE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
        assert!(paths.state_dir.ends_with("agentbox"));
    }

    #[test]
    fn workspaces_override_independent_of_data_dir() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("AGENTBOX_WORKSPACES", "/srv/sandboxes");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.workspaces, PathBuf::from("/srv/sandboxes"));
        assert!(paths.data_dir.ends_with("agentbox"));
    }

    #[test]
    fn convenience_accessors() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(paths.config_file().ends_with("config.toml"));
        assert!(paths.audit_log().ends_with("agentbox.audit.jsonl"));
    }
}
