//! Per-session, path-contained workspace.
//!
//! Layout: `<base>/<organization>/<team>/<workspace>/<session>/`. Every
//! file operation goes through [`Workspace::resolve`], which refuses `..`
//! components, absolute paths, and symlinks whose targets leave the root.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, SandboxError};
use crate::security::{AuditAction, AuditLog};

use super::request::SessionScope;

/// Upper bound on files listed by [`Workspace::snapshot`].
const MAX_SNAPSHOT_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Workspace {
    scope: SessionScope,
    root: PathBuf,
    audit: Option<AuditLog>,
}

impl Workspace {
    /// Create (or reopen) the workspace directory for `scope` under `base`.
    pub fn create(base: &Path, scope: &SessionScope) -> Result<Self> {
        scope.validate()?;
        let root = base
            .join(&scope.organization_id)
            .join(&scope.team_id)
            .join(&scope.workspace_id)
            .join(&scope.session_id);
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        debug!("Workspace ready at {}", root.display());
        Ok(Self {
            scope: scope.clone(),
            root,
            audit: None,
        })
    }

    /// Record path traversal attempts in the security audit log.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    /// Resolve a workspace-relative path to an absolute path inside the root.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let mut clean = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(self.traversal(relative));
                }
            }
        }

        // Walk existing components; any symlink must land back inside the root.
        let mut resolved = self.root.clone();
        let mut parts = clean.components();
        for part in parts.by_ref() {
            let candidate = resolved.join(part);
            match fs::symlink_metadata(&candidate) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let target = match candidate.canonicalize() {
                        Ok(t) => t,
                        // Dangling link: its target cannot be checked.
                        Err(_) => return Err(self.traversal(relative)),
                    };
                    if !target.starts_with(&self.root) {
                        return Err(self.traversal(relative));
                    }
                    resolved = target;
                }
                Ok(_) => resolved = candidate,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    resolved = candidate;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        for rest in parts {
            resolved.push(rest);
        }

        if !resolved.starts_with(&self.root) {
            return Err(self.traversal(relative));
        }
        Ok(resolved)
    }

    pub fn write(&self, relative: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<PathBuf> {
        let path = self.resolve(&relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Directory creation may have raced with a symlink swap; check again.
        let path = self.resolve(&relative)?;
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn read(&self, relative: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        Ok(fs::read(path)?)
    }

    pub fn read_to_string(&self, relative: impl AsRef<Path>) -> Result<String> {
        let path = self.resolve(relative)?;
        Ok(fs::read_to_string(path)?)
    }

    pub fn exists(&self, relative: impl AsRef<Path>) -> Result<bool> {
        let path = self.resolve(relative)?;
        Ok(path.exists())
    }

    /// Entries of a directory, as workspace-relative paths, sorted.
    pub fn list(&self, relative: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = self.resolve(relative)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                entries.push(rel.to_path_buf());
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn remove(&self, relative: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(relative)?;
        if path == self.root {
            return Err(SandboxError::Validation(
                "refusing to remove the workspace root".into(),
            ));
        }
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All regular files under the root, workspace-relative. Symlinks,
    /// including links to directories, are neither listed nor followed.
    pub fn snapshot(&self) -> Result<BTreeSet<PathBuf>> {
        let mut files = BTreeSet::new();
        let walk = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file());
        for entry in walk.take(MAX_SNAPSHOT_ENTRIES) {
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.insert(rel.to_path_buf());
            }
        }
        Ok(files)
    }

    /// Delete the workspace directory.
    pub fn teardown(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the workspace directory under `archive_dir`, returning its new location.
    pub fn archive(&self, archive_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(archive_dir)?;
        let name = format!(
            "{}-{}-{}-{}-{}",
            self.scope.organization_id,
            self.scope.team_id,
            self.scope.workspace_id,
            self.scope.session_id,
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        );
        let dest = archive_dir.join(name);
        fs::rename(&self.root, &dest)?;
        Ok(dest)
    }

    fn traversal(&self, path: &Path) -> SandboxError {
        warn!(
            session = %self.scope.session_id,
            "Blocked path escaping workspace: {}",
            path.display()
        );
        if let Some(ref audit) = self.audit {
            audit.record(
                AuditAction::PathTraversalBlocked,
                &self.scope.session_id,
                Some(&path.display().to_string()),
            );
        }
        SandboxError::PathTraversal {
            path: path.to_path_buf(),
        }
    }
}
