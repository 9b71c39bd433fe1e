//! Approval delivered over a channel by any transport (console, socket, UI).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{ApprovalDecision, ApprovalGate, ApprovalRequest};

/// A request waiting for its decision.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    pub fn respond(self, decision: ApprovalDecision) {
        // The gate may have stopped waiting; that is its rejection to record.
        let _ = self.reply.send(decision);
    }

    pub fn approve(self) {
        self.respond(ApprovalDecision::Approve);
    }

    pub fn reject(self, reason: impl Into<String>) {
        self.respond(ApprovalDecision::reject(reason));
    }
}

/// Gate that forwards each request to a receiver and waits for the reply.
///
/// A dropped receiver, a dropped reply handle, or an elapsed timeout all
/// resolve to a rejection.
#[derive(Debug, Clone)]
pub struct ChannelApprovalGate {
    tx: mpsc::Sender<PendingApproval>,
    timeout: Option<Duration>,
}

impl ChannelApprovalGate {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx, timeout: None }, rx)
    }

    /// Reject requests that receive no decision within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let (reply, rx) = oneshot::channel();
        let pending = PendingApproval {
            request: request.clone(),
            reply,
        };
        if self.tx.send(pending).await.is_err() {
            return ApprovalDecision::reject("approval channel closed");
        }

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return ApprovalDecision::reject(format!(
                        "no decision within {}s",
                        limit.as_secs()
                    ))
                }
            },
            None => rx.await,
        };
        outcome.unwrap_or_else(|_| ApprovalDecision::reject("approval request dropped"))
    }
}
