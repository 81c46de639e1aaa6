use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ContainerConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::output::OutputCapture;
use crate::sandbox::request::{BackendKind, ExecutionRequest, Language};
use crate::sandbox::workspace::Workspace;

use super::{Executor, drive_child, spawn_error};

/// `docker run` exits with 125 when the daemon could not create the container.
/// A program inside the container may exit with 125 as well; the cidfile
/// tells the two apart.
const RUNTIME_FAILURE_EXIT: i32 = 125;

/// Mount point of the session workspace inside containers.
pub(crate) const CONTAINER_WORKSPACE: &str = "/workspace";

/// One disposable container per execution.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    config: ContainerConfig,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    fn image_for(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.config.images.python,
            Language::Shell => &self.config.images.shell,
            Language::JavaScript => &self.config.images.javascript,
        }
    }

    fn run_args(
        &self,
        name: &str,
        cidfile: &Path,
        request: &ExecutionRequest,
        workspace_root: &Path,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            name.into(),
            // Written by the runtime once the container exists.
            "--cidfile".into(),
            cidfile.display().to_string(),
        ];
        args.extend(isolation_args(
            &self.config,
            request.memory_limit_bytes,
            workspace_root,
        ));
        args.push("--read-only".into());
        args.push("--tmpfs".into());
        args.push("/tmp:size=64m,nosuid".into());

        let (interpreter, interpreter_args) = request.language.interpreter();
        args.push(self.image_for(request.language).to_string());
        args.push(interpreter.to_string());
        args.extend(interpreter_args.iter().map(|a| a.to_string()));
        args
    }
}

/// Hardening and resource flags shared by disposable and managed containers.
pub(crate) fn isolation_args(
    config: &ContainerConfig,
    memory_bytes: u64,
    workspace_root: &Path,
) -> Vec<String> {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();

    vec![
        "--network".into(),
        config.network.clone(),
        "--memory".into(),
        memory_bytes.to_string(),
        "--memory-swap".into(),
        memory_bytes.to_string(),
        "--pids-limit".into(),
        config.pids_limit.to_string(),
        "--cpus".into(),
        format!("{:.2}", config.cpu_percent as f64 / 100.0),
        "--cap-drop=ALL".into(),
        "--security-opt=no-new-privileges".into(),
        // Files written to the bind mount stay owned by the host user.
        "--user".into(),
        format!("{}:{}", uid, gid),
        "-e".into(),
        format!("HOME={}", CONTAINER_WORKSPACE),
        "-v".into(),
        format!("{}:{}", workspace_root.display(), CONTAINER_WORKSPACE),
        "-w".into(),
        CONTAINER_WORKSPACE.into(),
    ]
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        workspace: &Workspace,
        capture: &OutputCapture,
    ) -> Result<i32> {
        let name = format!("agentbox-{}", uuid::Uuid::new_v4().simple());
        let cidfile = std::env::temp_dir().join(format!("{}.cid", name));
        let args = self.run_args(&name, &cidfile, request, workspace.root());

        let child = Command::new(&self.config.runtime)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(BackendKind::Container, &self.config.runtime, e))?;

        let mut guard = ContainerGuard::new(&self.config.runtime, &name, cidfile);
        debug!(
            session = %request.session_id(),
            container = %name,
            image = %self.image_for(request.language),
            "Started container"
        );

        let code = drive_child(child, &request.code, capture).await?;
        // --rm has removed it.
        guard.disarm();

        if code == RUNTIME_FAILURE_EXIT && !guard.container_created() {
            let stderr = capture.snapshot().stderr;
            return Err(SandboxError::SandboxNotAvailable {
                backend: BackendKind::Container,
                reason: format!(
                    "{} could not start the container: {}",
                    self.config.runtime,
                    stderr.trim()
                ),
            });
        }
        Ok(code)
    }
}

/// Force-removes the container if the execution is abandoned, and always
/// deletes its cidfile.
///
/// Killing the `docker run` client does not stop the container itself.
struct ContainerGuard {
    runtime: String,
    name: String,
    cidfile: PathBuf,
    armed: bool,
}

impl ContainerGuard {
    fn new(runtime: &str, name: &str, cidfile: PathBuf) -> Self {
        Self {
            runtime: runtime.to_string(),
            name: name.to_string(),
            cidfile,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Whether the runtime got as far as creating the container.
    fn container_created(&self) -> bool {
        std::fs::read_to_string(&self.cidfile).is_ok_and(|id| !id.trim().is_empty())
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.cidfile);
        if !self.armed {
            return;
        }
        debug!("Removing abandoned container {}", self.name);
        remove_container(&self.runtime, &self.name);
    }
}

/// `<runtime> rm -f <name>`, in the background when a runtime is available.
pub(crate) fn remove_container(runtime: &str, name: &str) {
    let runtime = runtime.to_string();
    let name = name.to_string();

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let status = Command::new(&runtime)
                    .args(["rm", "-f", &name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if let Err(e) = status {
                    warn!("Failed to remove container {}: {}", name, e);
                }
            });
        }
        Err(_) => {
            let _ = std::process::Command::new(&runtime)
                .args(["rm", "-f", &name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}
