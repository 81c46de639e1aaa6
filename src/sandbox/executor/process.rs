use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::child::{SANDBOX_ARG0, apply_rlimits};
use crate::sandbox::output::OutputCapture;
use crate::sandbox::policy::{ResourceLimits, SandboxLevel, build_policy};
use crate::sandbox::request::{BackendKind, ExecutionRequest};
use crate::sandbox::workspace::Workspace;

use super::{Executor, drive_child_with, spawn_error};

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs code as a host child process confined to the session workspace.
///
/// With a kernel sandbox level above `None`, the binary re-executes itself
/// with argv[0]="agentbox-sandbox" so Landlock and seccomp are applied in
/// the child before the interpreter is exec'd. Otherwise the interpreter is
/// spawned directly with rlimits set in `pre_exec`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    config: SandboxConfig,
    level: SandboxLevel,
}

impl ProcessExecutor {
    pub fn new(config: SandboxConfig, level: SandboxLevel) -> Self {
        Self { config, level }
    }

    pub fn level(&self) -> SandboxLevel {
        self.level
    }

    fn command(&self, request: &ExecutionRequest, workspace: &Workspace) -> Result<Command> {
        use std::os::unix::process::CommandExt;

        let (interpreter, args) = request.language.interpreter();

        let mut cmd = if self.level > SandboxLevel::None {
            let policy = build_policy(
                &self.config,
                workspace.root(),
                self.level,
                request.memory_limit_bytes,
            );
            let policy_json = serde_json::to_string(&policy)
                .map_err(|e| SandboxError::Internal(format!("policy encoding: {}", e)))?;
            let exe = std::env::current_exe()?;

            // argv: [agentbox-sandbox, policy, interpreter, args...]
            let mut cmd = Command::new(exe);
            cmd.as_std_mut().arg0(SANDBOX_ARG0);
            cmd.arg(policy_json).arg(interpreter).args(args);
            cmd
        } else {
            let limits = ResourceLimits::from_config(&self.config, request.memory_limit_bytes);
            let mut cmd = Command::new(interpreter);
            cmd.args(args);
            unsafe {
                cmd.as_std_mut()
                    .pre_exec(move || apply_rlimits(&limits).map_err(std::io::Error::from));
            }
            cmd
        };

        let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
        cmd.current_dir(workspace.root())
            .env_clear()
            .env("PATH", path)
            .env("HOME", workspace.root())
            .env("TMPDIR", "/tmp")
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so the whole tree can be killed at once.
        cmd.as_std_mut().process_group(0);
        Ok(cmd)
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        workspace: &Workspace,
        capture: &OutputCapture,
    ) -> Result<i32> {
        let mut cmd = self.command(request, workspace)?;
        let (interpreter, _) = request.language.interpreter();
        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(BackendKind::Process, interpreter, e))?;

        let mut group = ProcessGroupGuard(child.id());
        debug!(
            session = %request.session_id(),
            pid = ?child.id(),
            level = ?self.level,
            "Spawned {} process",
            request.language
        );

        // The group is killed while its leader is still an unreaped zombie,
        // so the pgid cannot have been recycled by then.
        let before_reap = async {
            if let Some(pid) = group.0 {
                match leader_exited(pid).await {
                    Ok(()) => group.kill(),
                    Err(e) => {
                        warn!("Cannot observe exit of process {}: {}", pid, e);
                        group.disarm();
                    }
                }
            }
        };
        drive_child_with(child, &request.code, capture, before_reap).await
    }
}

/// Kills the whole process group: on drop (deadline, cancellation), and
/// explicitly once the leader has exited, to catch backgrounded children.
struct ProcessGroupGuard(Option<u32>);

impl ProcessGroupGuard {
    fn kill(&mut self) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pgid) = self.0.take() {
            let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
        }
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Resolves once `pid` has exited, leaving it unreaped.
async fn leader_exited(pid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::wait::{Id, WaitPidFlag, waitid};
    use nix::unistd::Pid;

    tokio::task::spawn_blocking(move || {
        loop {
            match waitid(
                Id::Pid(Pid::from_raw(pid as i32)),
                WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
            ) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(std::io::Error::from(e)),
                Ok(_) => return Ok(()),
            }
        }
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::request::{Language, SessionScope};
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, Workspace, ProcessExecutor) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::create(tmp.path(), &SessionScope::for_session("proc")).unwrap();
        // Tests run inside the test harness binary, which cannot act as the
        // re-exec'd sandbox child.
        // RLIMIT_NPROC counts every process of the user, not just ours.
        let config = SandboxConfig {
            max_processes: 4096,
            ..SandboxConfig::default()
        };
        let exec = ProcessExecutor::new(config, SandboxLevel::None);
        (tmp, ws, exec)
    }

    fn shell(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(SessionScope::for_session("proc"), Language::Shell, code)
    }

    #[tokio::test]
    async fn test_runs_in_workspace_with_clean_env() {
        let (_tmp, ws, exec) = setup();
        let capture = OutputCapture::new(4096);

        let code = exec
            .execute(
                &shell("pwd; echo \"$HOME\"; echo \"${AWS_SECRET_ACCESS_KEY:-unset}\"; echo data > out.txt"),
                &ws,
                &capture,
            )
            .await
            .unwrap();

        assert_eq!(code, 0);
        let root = ws.root().display().to_string();
        let out = capture.snapshot();
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines, vec![root.as_str(), root.as_str(), "unset"]);
        assert_eq!(ws.read_to_string("out.txt").unwrap(), "data\n");
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let (_tmp, ws, exec) = setup();
        let capture = OutputCapture::new(4096);
        let code = exec
            .execute(&shell("echo oops >&2; exit 3"), &ws, &capture)
            .await
            .unwrap();
        assert_eq!(code, 3);
        assert_eq!(capture.snapshot().stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_python_print() {
        let (_tmp, ws, exec) = setup();
        let capture = OutputCapture::new(4096);
        let req = ExecutionRequest::new(SessionScope::for_session("proc"), Language::Python, "print(1)");

        let code = exec.execute(&req, &ws, &capture).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(capture.snapshot().stdout, "1\n");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_future_kills_process_group() {
        let (_tmp, ws, exec) = setup();
        let capture = OutputCapture::new(4096);

        let req = shell("sleep 30 & echo $!; wait");
        let run = exec.execute(&req, &ws, &capture);
        assert!(tokio::time::timeout(Duration::from_millis(500), run).await.is_err());

        let pid: u32 = capture.snapshot().stdout.trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..50 {
            if !is_running(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background sleep {} survived", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_normal_exit_kills_background_children() {
        let (_tmp, ws, exec) = setup();
        let capture = OutputCapture::new(4096);

        let req = shell("sleep 30 >/dev/null 2>&1 & echo $!");
        let code = exec.execute(&req, &ws, &capture).await.unwrap();
        assert_eq!(code, 0);

        let pid: u32 = capture.snapshot().stdout.trim().parse().unwrap();
        let mut alive = true;
        for _ in 0..50 {
            if !is_running(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background sleep {} survived", pid);
    }

    #[test]
    fn test_disarmed_group_guard_does_not_signal() {
        let mut guard = ProcessGroupGuard(Some(u32::MAX));
        guard.disarm();
        assert!(guard.0.is_none());
        guard.kill();
        assert!(guard.0.is_none());
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        // Zombies count as dead: they only wait to be reaped.
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.contains(") Z "),
            Err(_) => false,
        }
    }
}
