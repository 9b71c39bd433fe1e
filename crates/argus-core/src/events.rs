//! Status-transition events for dashboards, narration and logs.
//!
//! The controller publishes one [`StatusEvent`] per transition to an
//! [`EventBus`]. Subscribers observe; they cannot influence remediation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{RemediationStatus, VulnerabilityId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub vulnerability: VulnerabilityId,
    /// Short display label, e.g. "SQL Injection".
    pub category: String,
    pub from: RemediationStatus,
    pub to: RemediationStatus,
    pub timestamp: DateTime<Utc>,
    /// Attempt index for attempt-scoped transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl StatusEvent {
    pub fn new(
        vulnerability: VulnerabilityId,
        category: impl Into<String>,
        from: RemediationStatus,
        to: RemediationStatus,
        attempt: Option<u32>,
    ) -> Self {
        Self {
            vulnerability,
            category: category.into(),
            from,
            to,
            timestamp: Utc::now(),
            attempt,
        }
    }
}

/// Observer of status transitions. Must not block.
pub trait StatusSubscriber: Send + Sync {
    fn on_status(&self, event: &StatusEvent);
}

/// Fan-out to every registered subscriber, in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn StatusSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn StatusSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn with(mut self, subscriber: Arc<dyn StatusSubscriber>) -> Self {
        self.subscribe(subscriber);
        self
    }

    pub fn publish(&self, event: &StatusEvent) {
        for subscriber in &self.subscribers {
            subscriber.on_status(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// Logs every transition with its narration line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSubscriber;

impl StatusSubscriber for TracingSubscriber {
    fn on_status(&self, event: &StatusEvent) {
        tracing::info!(
            event = "status.changed",
            vulnerability = %event.vulnerability,
            from = %event.from,
            to = %event.to,
            "{}",
            narration_for(event),
        );
    }
}

/// Forwards events to an unbounded channel for an external renderer.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSubscriber for ChannelSubscriber {
    fn on_status(&self, event: &StatusEvent) {
        // A closed receiver means nobody is rendering any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Plain-text line describing a transition, for speech or a status ticker.
pub fn narration_for(event: &StatusEvent) -> String {
    let what = &event.category;
    let file = &event.vulnerability.file;
    match event.to {
        RemediationStatus::Detected => format!("Detected {what} in {file}."),
        RemediationStatus::Analyzing => format!("Analyzing {what} in {file}..."),
        RemediationStatus::GeneratingExploit => {
            format!("Generating a proof-of-concept exploit for {file}...")
        }
        RemediationStatus::PatchGenerating => match event.attempt {
            Some(n) if n > 0 => format!("Retry {n}: generating a corrected patch for {file}..."),
            _ => format!("Generating a patch for {what} in {file}..."),
        },
        RemediationStatus::AwaitingApproval => "Patch ready. Waiting for approval...".to_string(),
        RemediationStatus::Patching => format!("Applying patch to {file}..."),
        RemediationStatus::VerifyingPatch => "Verifying the patch...".to_string(),
        RemediationStatus::RetryPending => "Verification failed. Retrying...".to_string(),
        RemediationStatus::Evolving => {
            "Retries exhausted. Rewriting the repair instructions...".to_string()
        }
        RemediationStatus::Fixed => format!("Patch verified. {what} in {file} is fixed."),
        RemediationStatus::SkillUpgraded => {
            "Repair instructions upgraded for future runs.".to_string()
        }
        RemediationStatus::Failed => format!("Remediation of {what} in {file} failed."),
        RemediationStatus::Skipped => format!("Patch for {file} rejected. Skipping."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<RemediationStatus>>);

    impl StatusSubscriber for Collect {
        fn on_status(&self, event: &StatusEvent) {
            self.0.lock().unwrap().push(event.to);
        }
    }

    fn event(to: RemediationStatus, attempt: Option<u32>) -> StatusEvent {
        StatusEvent::new(
            VulnerabilityId {
                file: "login.py".into(),
                vuln_type: "SQL Injection".into(),
                line: 5,
            },
            "SQL Injection",
            RemediationStatus::Detected,
            to,
            attempt,
        )
    }

    #[test]
    fn bus_fans_out_to_all() {
        let a = Arc::new(Collect(Mutex::new(Vec::new())));
        let b = Arc::new(Collect(Mutex::new(Vec::new())));
        let bus = EventBus::new().with(a.clone()).with(b.clone());

        bus.publish(&event(RemediationStatus::Analyzing, None));
        assert_eq!(*a.0.lock().unwrap(), vec![RemediationStatus::Analyzing]);
        assert_eq!(*b.0.lock().unwrap(), vec![RemediationStatus::Analyzing]);
    }

    #[tokio::test]
    async fn channel_subscriber_forwards() {
        let (sub, mut rx) = ChannelSubscriber::new();
        sub.on_status(&event(RemediationStatus::Fixed, None));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.to, RemediationStatus::Fixed);
    }

    #[test]
    fn channel_subscriber_ignores_closed_receiver() {
        let (sub, rx) = ChannelSubscriber::new();
        drop(rx);
        sub.on_status(&event(RemediationStatus::Fixed, None));
    }

    #[test]
    fn narration_mentions_file_and_retry() {
        assert!(narration_for(&event(RemediationStatus::Analyzing, None)).contains("login.py"));
        assert!(narration_for(&event(RemediationStatus::PatchGenerating, Some(2))).starts_with("Retry 2"));
        assert!(narration_for(&event(RemediationStatus::Fixed, None)).contains("fixed"));
    }
}
