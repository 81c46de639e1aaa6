//! Pool of long-lived managed environments.
//!
//! Each session gets at most one environment, provisioned with that
//! session's workspace mounted and reused across its calls. Environments
//! are never handed to another session. At capacity, the least recently
//! active idle environment is evicted to make room; when every
//! environment is busy, acquisition fails with `PoolExhausted` and the
//! caller decides whether to retry.
//!
//! Pool state lives behind a std mutex that is never held across an
//! await: provisioning, health checks and teardown run after the lock is
//! released.

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ContainerConfig, PoolConfig};
use crate::error::{Result, SandboxError};

use super::executor::{isolation_args, spawn_error};
use super::request::{BackendKind, Language};

/// Creates, probes and destroys managed environments.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Start an environment with `workspace_root` mounted; returns its id.
    async fn provision(&self, session_id: &str, workspace_root: &Path) -> Result<String>;

    /// Command that runs `language` inside `env_id`, reading the program on stdin.
    fn exec_command(&self, env_id: &str, language: Language) -> Command;

    async fn is_healthy(&self, env_id: &str) -> bool;

    async fn destroy(&self, env_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct PooledEnvironment {
    id: String,
    session_id: String,
    created_at: Instant,
    last_active: Instant,
    healthy: bool,
    in_use: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    environments: Vec<PooledEnvironment>,
    /// Slots reserved by acquisitions that are still provisioning.
    provisioning: usize,
    shut_down: bool,
}

struct PoolInner {
    provider: Arc<dyn EnvironmentProvider>,
    max_size: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return an environment to the pool. Gives back the id when the
    /// environment must be destroyed instead.
    fn check_in(&self, env_id: &str, healthy: bool) -> Option<String> {
        let mut state = self.lock();
        let index = state.environments.iter().position(|e| e.id == env_id)?;
        let env = &mut state.environments[index];
        if healthy && env.healthy {
            env.in_use = false;
            env.last_active = Instant::now();
            None
        } else {
            Some(state.environments.remove(index).id)
        }
    }

    async fn destroy(&self, env_id: &str) {
        match self.provider.destroy(env_id).await {
            Ok(()) => debug!("Destroyed managed environment {}", env_id),
            Err(e) => warn!("Failed to destroy managed environment {}: {}", env_id, e),
        }
    }
}

/// Occupancy snapshot for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub provisioning: usize,
    /// Age of the oldest live environment.
    pub oldest_secs: u64,
}

#[derive(Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("max_size", &self.inner.max_size)
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish()
    }
}

/// Checked-out environment.
///
/// Hand it back with [`BackendPool::release`]. A lease dropped without
/// release belonged to an interrupted execution: its environment is
/// destroyed.
pub struct EnvironmentLease {
    pool: Arc<PoolInner>,
    env_id: String,
    session_id: String,
    returned: bool,
}

impl std::fmt::Debug for EnvironmentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentLease")
            .field("env_id", &self.env_id)
            .field("session_id", &self.session_id)
            .field("returned", &self.returned)
            .finish()
    }
}

impl EnvironmentLease {
    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let Some(env_id) = self.pool.check_in(&self.env_id, false) else {
            return;
        };
        warn!(
            "Managed environment {} interrupted mid-execution, destroying",
            env_id
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            handle.spawn(async move { pool.destroy(&env_id).await });
        }
    }
}

/// Releases a provisioning slot if acquisition is abandoned.
struct Reservation {
    pool: Arc<PoolInner>,
    active: bool,
}

impl Reservation {
    fn complete(mut self, state: &mut PoolState) {
        self.active = false;
        state.provisioning = state.provisioning.saturating_sub(1);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.active {
            let mut state = self.pool.lock();
            state.provisioning = state.provisioning.saturating_sub(1);
        }
    }
}

fn shut_down_error() -> SandboxError {
    SandboxError::SandboxNotAvailable {
        backend: BackendKind::ManagedEnvironment,
        reason: "environment pool is shut down".to_string(),
    }
}

impl BackendPool {
    pub fn new(provider: Arc<dyn EnvironmentProvider>, max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                provider,
                max_size,
                idle_timeout,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn from_config(provider: Arc<dyn EnvironmentProvider>, config: &PoolConfig) -> Self {
        Self::new(provider, config.max_size, config.idle_timeout())
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_size
    }

    /// Check out the session's environment, provisioning one if needed.
    pub async fn acquire(&self, session_id: &str, workspace_root: &Path) -> Result<EnvironmentLease> {
        let mut stale = Vec::new();

        let reuse = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return Err(shut_down_error());
            }
            match state
                .environments
                .iter()
                .position(|e| e.session_id == session_id)
            {
                Some(i) if state.environments[i].in_use => {
                    return Err(SandboxError::ConcurrentAccess(session_id.to_string()));
                }
                Some(i) if state.environments[i].healthy => {
                    let env = &mut state.environments[i];
                    env.in_use = true;
                    env.last_active = Instant::now();
                    Some(env.id.clone())
                }
                Some(i) => {
                    stale.push(state.environments.remove(i).id);
                    None
                }
                None => None,
            }
        };

        if let Some(env_id) = reuse {
            if self.inner.provider.is_healthy(&env_id).await {
                debug!("Reusing managed environment {} for session {}", env_id, session_id);
                return Ok(self.lease(env_id, session_id));
            }
            warn!("Managed environment {} failed its health check, replacing", env_id);
            if let Some(id) = self.inner.check_in(&env_id, false) {
                stale.push(id);
            }
        }

        let reservation = self.reserve_slot(&mut stale);
        for env_id in &stale {
            self.inner.destroy(env_id).await;
        }
        let reservation = reservation?;

        let env_id = self
            .inner
            .provider
            .provision(session_id, workspace_root)
            .await?;

        let now = Instant::now();
        let shut_down = {
            let mut state = self.inner.lock();
            reservation.complete(&mut state);
            if !state.shut_down {
                state.environments.push(PooledEnvironment {
                    id: env_id.clone(),
                    session_id: session_id.to_string(),
                    created_at: now,
                    last_active: now,
                    healthy: true,
                    in_use: true,
                });
            }
            state.shut_down
        };
        if shut_down {
            self.inner.destroy(&env_id).await;
            return Err(shut_down_error());
        }

        info!("Provisioned managed environment {} for session {}", env_id, session_id);
        Ok(self.lease(env_id, session_id))
    }

    /// Reserve room for one more environment, evicting the least recently
    /// active idle one at capacity. Evicted ids are pushed onto `evicted`.
    fn reserve_slot(&self, evicted: &mut Vec<String>) -> Result<Reservation> {
        let mut state = self.inner.lock();
        if state.shut_down {
            return Err(shut_down_error());
        }

        if state.environments.len() + state.provisioning >= self.inner.max_size {
            let victim = state
                .environments
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.in_use)
                .min_by_key(|(_, e)| e.last_active)
                .map(|(i, _)| i);

            match victim {
                Some(i) => {
                    let env = state.environments.remove(i);
                    info!(
                        "Pool at capacity, evicting idle environment {} of session {}",
                        env.id, env.session_id
                    );
                    evicted.push(env.id);
                }
                None => {
                    return Err(SandboxError::PoolExhausted {
                        capacity: self.inner.max_size,
                    });
                }
            }
        }

        state.provisioning += 1;
        Ok(Reservation {
            pool: self.inner.clone(),
            active: true,
        })
    }

    fn lease(&self, env_id: String, session_id: &str) -> EnvironmentLease {
        EnvironmentLease {
            pool: self.inner.clone(),
            env_id,
            session_id: session_id.to_string(),
            returned: false,
        }
    }

    /// Command running `language` inside the leased environment.
    pub fn exec_command(&self, lease: &EnvironmentLease, language: Language) -> Command {
        self.inner.provider.exec_command(&lease.env_id, language)
    }

    /// Hand an environment back. Unhealthy environments are destroyed.
    pub async fn release(&self, mut lease: EnvironmentLease, healthy: bool) {
        lease.returned = true;
        if let Some(env_id) = self.inner.check_in(&lease.env_id, healthy) {
            debug!("Discarding managed environment {}", env_id);
            self.inner.destroy(&env_id).await;
        }
    }

    /// Destroy idle environments past the inactivity threshold, and any
    /// idle environment already marked unhealthy. Returns how many went.
    pub async fn reap_expired(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut state = self.inner.lock();
            let idle_timeout = self.inner.idle_timeout;
            state.environments.retain(|env| {
                let stale = !env.in_use && (!env.healthy || env.last_active.elapsed() >= idle_timeout);
                if stale {
                    expired.push(env.id.clone());
                }
                !stale
            });
        }

        for env_id in &expired {
            info!("Reaping idle managed environment {}", env_id);
            self.inner.destroy(env_id).await;
        }
        expired.len()
    }

    /// Run [`reap_expired`](Self::reap_expired) every `interval` until the
    /// pool is shut down or dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.lock().shut_down {
                    break;
                }
                let reaped = BackendPool { inner }.reap_expired().await;
                if reaped > 0 {
                    debug!("Reaper removed {} environment(s)", reaped);
                }
            }
        })
    }

    /// Destroy the session's environment. One still executing is marked
    /// unhealthy and destroyed when its lease comes back.
    pub async fn release_session(&self, session_id: &str) {
        let to_destroy = {
            let mut state = self.inner.lock();
            match state
                .environments
                .iter()
                .position(|e| e.session_id == session_id)
            {
                Some(i) if state.environments[i].in_use => {
                    state.environments[i].healthy = false;
                    None
                }
                Some(i) => Some(state.environments.remove(i).id),
                None => None,
            }
        };

        if let Some(env_id) = to_destroy {
            info!("Releasing managed environment {} of session {}", env_id, session_id);
            self.inner.destroy(&env_id).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let in_use = state.environments.iter().filter(|e| e.in_use).count();
        PoolStats {
            capacity: self.inner.max_size,
            total: state.environments.len(),
            in_use,
            idle: state.environments.len() - in_use,
            provisioning: state.provisioning,
            oldest_secs: state
                .environments
                .iter()
                .map(|e| e.created_at.elapsed().as_secs())
                .max()
                .unwrap_or(0),
        }
    }

    /// Whether `session_id` currently has an environment.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .environments
            .iter()
            .any(|e| e.session_id == session_id)
    }

    /// Destroy every environment and refuse further acquisitions.
    pub async fn shutdown(&self) {
        let all: Vec<String> = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            state.environments.drain(..).map(|e| e.id).collect()
        };
        if !all.is_empty() {
            info!("Shutting down pool, destroying {} environment(s)", all.len());
        }
        for env_id in &all {
            self.inner.destroy(env_id).await;
        }
    }
}

/// Managed environments as long-running containers driven through the
/// container CLI: `run -d ... sleep infinity`, then `exec -i` per call.
#[derive(Debug, Clone)]
pub struct DockerEnvironmentProvider {
    container: ContainerConfig,
    image: String,
    memory_bytes: u64,
}

impl DockerEnvironmentProvider {
    pub fn new(container: ContainerConfig, pool: &PoolConfig, memory_bytes: u64) -> Self {
        Self {
            container,
            image: pool.image.clone(),
            memory_bytes,
        }
    }

    fn provision_args(&self, name: &str, session_id: &str, workspace_root: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            format!("agentbox.session={}", session_id),
        ];
        args.extend(isolation_args(&self.container, self.memory_bytes, workspace_root));
        args.push(self.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }

    async fn runtime_output(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.container.runtime)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(BackendKind::ManagedEnvironment, &self.container.runtime, e))
    }
}

#[async_trait]
impl EnvironmentProvider for DockerEnvironmentProvider {
    async fn provision(&self, session_id: &str, workspace_root: &Path) -> Result<String> {
        let name = format!("agentbox-env-{}", uuid::Uuid::new_v4().simple());
        let args = self.provision_args(&name, session_id, workspace_root);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.runtime_output(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::SandboxNotAvailable {
                backend: BackendKind::ManagedEnvironment,
                reason: format!(
                    "failed to start environment: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(name)
    }

    fn exec_command(&self, env_id: &str, language: Language) -> Command {
        let (interpreter, args) = language.interpreter();
        let mut cmd = Command::new(&self.container.runtime);
        cmd.args(["exec", "-i", env_id, interpreter]).args(args);
        cmd
    }

    async fn is_healthy(&self, env_id: &str) -> bool {
        match self
            .runtime_output(&["inspect", "-f", "{{.State.Running}}", env_id])
            .await
        {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(_) => false,
        }
    }

    async fn destroy(&self, env_id: &str) -> Result<()> {
        let output = self.runtime_output(&["rm", "-f", env_id]).await?;
        if !output.status.success() {
            return Err(SandboxError::Io(format!(
                "{} rm failed: {}",
                self.container.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// In-process provider for tests: environments are host directories and
/// "exec" runs the interpreter locally inside the mounted workspace.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeProvider {
        next_id: AtomicUsize,
        roots: Mutex<HashMap<String, PathBuf>>,
        unhealthy: Mutex<HashSet<String>>,
        destroyed: Mutex<Vec<String>>,
        provisioned: Mutex<Vec<(String, String)>>,
    }

    impl FakeProvider {
        pub fn mark_unhealthy(&self, env_id: &str) {
            self.unhealthy.lock().unwrap().insert(env_id.to_string());
        }

        pub fn destroyed(&self) -> Vec<String> {
            self.destroyed.lock().unwrap().clone()
        }

        /// (env id, session id) in provisioning order.
        pub fn provisioned(&self) -> Vec<(String, String)> {
            self.provisioned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EnvironmentProvider for FakeProvider {
        async fn provision(&self, session_id: &str, workspace_root: &Path) -> Result<String> {
            let id = format!("env-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.roots
                .lock()
                .unwrap()
                .insert(id.clone(), workspace_root.to_path_buf());
            self.provisioned
                .lock()
                .unwrap()
                .push((id.clone(), session_id.to_string()));
            Ok(id)
        }

        fn exec_command(&self, env_id: &str, language: Language) -> Command {
            let (interpreter, args) = language.interpreter();
            let mut cmd = Command::new(interpreter);
            cmd.args(args);
            if let Some(root) = self.roots.lock().unwrap().get(env_id) {
                cmd.current_dir(root);
            }
            cmd
        }

        async fn is_healthy(&self, env_id: &str) -> bool {
            !self.unhealthy.lock().unwrap().contains(env_id)
        }

        async fn destroy(&self, env_id: &str) -> Result<()> {
            self.destroyed.lock().unwrap().push(env_id.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProvider;
    use super::*;

    fn pool(max_size: usize) -> (Arc<FakeProvider>, BackendPool) {
        let provider = Arc::new(FakeProvider::default());
        let pool = BackendPool::new(provider.clone(), max_size, Duration::from_secs(600));
        (provider, pool)
    }

    #[tokio::test]
    async fn test_reuses_environment_within_session() {
        let (provider, pool) = pool(2);
        let root = Path::new("/tmp");

        let lease = pool.acquire("s1", root).await.unwrap();
        let first = lease.env_id().to_string();
        pool.release(lease, true).await;

        let lease = pool.acquire("s1", root).await.unwrap();
        assert_eq!(lease.env_id(), first);
        pool.release(lease, true).await;

        assert_eq!(provider.provisioned().len(), 1);
        let stats = pool.stats();
        assert_eq!((stats.total, stats.in_use, stats.idle), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_never_shares_across_sessions() {
        let (_provider, pool) = pool(4);
        let a = pool.acquire("a", Path::new("/tmp")).await.unwrap();
        let a_id = a.env_id().to_string();
        pool.release(a, true).await;

        let b = pool.acquire("b", Path::new("/tmp")).await.unwrap();
        assert_ne!(b.env_id(), a_id);
        assert_eq!(b.session_id(), "b");
        pool.release(b, true).await;
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn test_at_capacity_evicts_least_recently_active_idle() {
        let (provider, pool) = pool(2);
        let root = Path::new("/tmp");

        let a = pool.acquire("a", root).await.unwrap();
        let a_id = a.env_id().to_string();
        pool.release(a, true).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let b = pool.acquire("b", root).await.unwrap();
        let b_id = b.env_id().to_string();
        pool.release(b, true).await;

        let c = pool.acquire("c", root).await.unwrap();
        assert_eq!(c.session_id(), "c");
        assert_eq!(provider.destroyed(), vec![a_id]);
        assert!(pool.has_session("b"));
        assert!(!pool.has_session("a"));
        assert_ne!(c.env_id(), b_id);
        pool.release(c, true).await;
        assert_eq!(pool.stats().total, 2);
    }

    #[tokio::test]
    async fn test_all_busy_is_exhausted() {
        let (_provider, pool) = pool(1);
        let busy = pool.acquire("a", Path::new("/tmp")).await.unwrap();

        let err = pool.acquire("b", Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, SandboxError::PoolExhausted { capacity: 1 }));

        pool.release(busy, true).await;
        assert!(pool.acquire("b", Path::new("/tmp")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_environment_is_replaced() {
        let (provider, pool) = pool(2);
        let lease = pool.acquire("s1", Path::new("/tmp")).await.unwrap();
        let first = lease.env_id().to_string();
        pool.release(lease, true).await;

        provider.mark_unhealthy(&first);
        let lease = pool.acquire("s1", Path::new("/tmp")).await.unwrap();
        assert_ne!(lease.env_id(), first);
        assert_eq!(provider.destroyed(), vec![first]);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_destroys_environment() {
        let (provider, pool) = pool(2);
        let lease = pool.acquire("s1", Path::new("/tmp")).await.unwrap();
        let id = lease.env_id().to_string();
        drop(lease);

        assert!(!pool.has_session("s1"));
        for _ in 0..50 {
            if provider.destroyed().contains(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(provider.destroyed(), vec![id]);
    }

    #[tokio::test]
    async fn test_reap_expired_only_touches_idle() {
        let provider = Arc::new(FakeProvider::default());
        let pool = BackendPool::new(provider.clone(), 4, Duration::from_millis(10));

        let idle = pool.acquire("idle", Path::new("/tmp")).await.unwrap();
        let idle_id = idle.env_id().to_string();
        pool.release(idle, true).await;
        let busy = pool.acquire("busy", Path::new("/tmp")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.reap_expired().await, 1);
        assert_eq!(provider.destroyed(), vec![idle_id]);
        assert!(pool.has_session("busy"));
        pool.release(busy, true).await;
    }

    #[tokio::test]
    async fn test_release_session_while_busy_destroys_on_return() {
        let (provider, pool) = pool(2);
        let lease = pool.acquire("s1", Path::new("/tmp")).await.unwrap();
        let id = lease.env_id().to_string();

        pool.release_session("s1").await;
        assert!(provider.destroyed().is_empty());

        pool.release(lease, true).await;
        assert_eq!(provider.destroyed(), vec![id]);
        assert!(!pool.has_session("s1"));
    }

    #[tokio::test]
    async fn test_shutdown_destroys_all_and_refuses() {
        let (provider, pool) = pool(3);
        for s in ["a", "b"] {
            let lease = pool.acquire(s, Path::new("/tmp")).await.unwrap();
            pool.release(lease, true).await;
        }

        pool.shutdown().await;
        assert_eq!(provider.destroyed().len(), 2);
        assert_eq!(pool.stats().total, 0);
        assert!(matches!(
            pool.acquire("c", Path::new("/tmp")).await,
            Err(SandboxError::SandboxNotAvailable { .. })
        ));
    }

    #[test]
    fn test_docker_provision_args() {
        let provider = DockerEnvironmentProvider::new(
            ContainerConfig::default(),
            &PoolConfig::default(),
            512 * 1024 * 1024,
        );
        let args = provider.provision_args("agentbox-env-x", "s1", Path::new("/ws/s1"));
        assert_eq!(&args[..4], ["run", "-d", "--name", "agentbox-env-x"]);
        assert!(args.contains(&"agentbox.session=s1".to_string()));
        assert!(args.contains(&"/ws/s1:/workspace".to_string()));
        assert_eq!(&args[args.len() - 2..], ["sleep", "infinity"]);

        let exec = provider.exec_command("agentbox-env-x", Language::Python);
        let argv: Vec<String> = exec
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv, vec!["exec", "-i", "agentbox-env-x", "python3", "-"]);
    }
}
