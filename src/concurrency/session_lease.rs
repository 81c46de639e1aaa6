//! Per-session execution leases.
//!
//! At most one execution may be in flight per session. Acquisition never
//! waits: a held lease fails the second caller immediately. Each lease
//! carries a cancellation signal so session cleanup can interrupt the
//! execution holding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::error::{Result, SandboxError};

#[derive(Debug, Default, Clone)]
pub struct SessionLeases {
    inner: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

/// RAII guard: the session is free again once this is dropped.
#[derive(Debug)]
pub struct SessionLease {
    session_id: String,
    cancel: Arc<Notify>,
    registry: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Resolves once [`SessionLeases::cancel`] is called for this session.
    pub async fn cancelled(&self) {
        self.cancel.notified().await
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut map = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only remove our own entry.
        if map
            .get(&self.session_id)
            .is_some_and(|n| Arc::ptr_eq(n, &self.cancel))
        {
            map.remove(&self.session_id);
        }
    }
}

impl SessionLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `session_id`, or fail with `ConcurrentAccess`.
    pub fn try_acquire(&self, session_id: &str) -> Result<SessionLease> {
        let mut map = self.lock();
        if map.contains_key(session_id) {
            return Err(SandboxError::ConcurrentAccess(session_id.to_string()));
        }
        let cancel = Arc::new(Notify::new());
        map.insert(session_id.to_string(), cancel.clone());
        Ok(SessionLease {
            session_id: session_id.to_string(),
            cancel,
            registry: self.inner.clone(),
        })
    }

    pub fn is_held(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Signal the execution holding `session_id` to stop. Returns false if idle.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(notify) => {
                // notify_one stores a permit, so a waiter that has not
                // started polling yet still observes it.
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Poll until the session's lease is released or `grace` elapses.
    pub async fn wait_released(&self, session_id: &str, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if !self.is_held(session_id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let leases = SessionLeases::new();
        let lease = leases.try_acquire("s1").unwrap();
        assert!(leases.is_held("s1"));
        assert_eq!(lease.session_id(), "s1");
        drop(lease);
        assert!(!leases.is_held("s1"));
        let _again = leases.try_acquire("s1").unwrap();
    }

    #[test]
    fn second_acquire_fails_fast() {
        let leases = SessionLeases::new();
        let _held = leases.try_acquire("s1").unwrap();
        assert!(matches!(
            leases.try_acquire("s1"),
            Err(SandboxError::ConcurrentAccess(ref s)) if s == "s1"
        ));
    }

    #[test]
    fn sessions_are_independent() {
        let leases = SessionLeases::new();
        let _a = leases.try_acquire("a").unwrap();
        let _b = leases.try_acquire("b").unwrap();
        assert_eq!(leases.active_count(), 2);
    }

    #[test]
    fn concurrent_threads_exactly_one_wins() {
        const THREADS: usize = 8;
        let leases = SessionLeases::new();
        let start = Arc::new(std::sync::Barrier::new(THREADS));
        // Winners keep their lease until every thread has tried.
        let attempted = Arc::new(std::sync::Barrier::new(THREADS));
        let wins = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let leases = leases.clone();
                let start = start.clone();
                let attempted = attempted.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    start.wait();
                    let lease = leases.try_acquire("shared");
                    if lease.is_ok() {
                        wins.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                    attempted.wait();
                    drop(lease);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(leases.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_wakes_holder() {
        let leases = SessionLeases::new();
        let lease = leases.try_acquire("s1").unwrap();

        assert!(leases.cancel("s1"));
        tokio::time::timeout(Duration::from_secs(1), lease.cancelled())
            .await
            .expect("cancellation should be observed");
        assert!(!leases.cancel("idle"));
    }

    #[tokio::test]
    async fn wait_released_observes_drop() {
        let leases = SessionLeases::new();
        let lease = leases.try_acquire("s1").unwrap();

        let waiter = {
            let leases = leases.clone();
            tokio::spawn(async move { leases.wait_released("s1", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(lease);
        assert!(waiter.await.unwrap());

        let _held = leases.try_acquire("s2").unwrap();
        assert!(!leases.wait_released("s2", Duration::from_millis(60)).await);
    }
}
