//! Outbound notification bookkeeping and the email effect handler.
//!
//! The `Emails.To.Send` view is the single source of truth for what
//! still needs delivering: assignments enqueue notifications, delivery
//! outcomes consume them, and the attempt counter caps retries. The
//! effect handler is stateless across invocations by design -- it reads
//! the view, attempts delivery, and feeds the outcome back as a fact.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::coordinator::Handle;
use crate::core::ViewState;
use crate::domain::assignment::MEMBER_ASSIGNED_TO_SUBSCRIPTION;
use crate::domain::subscription_partition;
use crate::effect::EffectHandler;
use crate::error::EffectError;
use crate::event::{Event, EventDraft};

/// View id of the outbound notification queue.
pub const EMAILS_TO_SEND: &str = "Emails.To.Send";
/// External fact: a notification was delivered.
pub const EMAIL_SUCCEEDED: &str = "Email.Succeeded";
/// External fact: a delivery attempt failed.
pub const EMAIL_FAILED: &str = "Email.Failed";

/// Delivery attempts after which a notification is dropped.
pub const MAX_EMAIL_ATTEMPTS: u64 = 10;

// ---------------------------------------------------------------------------
// Emails.To.Send
// ---------------------------------------------------------------------------

/// One queued notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Stable id allocated by the view (`mail-<n>`).
    pub id: String,
    /// Subscription the member joined.
    pub subscription_id: String,
    /// Member to notify.
    pub member_id: String,
    /// Failed delivery attempts so far.
    pub attempt: u64,
}

/// View of notifications awaiting delivery.
///
/// Notification ids come from `next_id`, which only the reducer
/// advances, so ids are stable across rollback and replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailsToSend {
    next_id: u64,
    list: Vec<Notification>,
}

impl ViewState for EmailsToSend {
    fn view_id(&self) -> &'static str {
        EMAILS_TO_SEND
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            MEMBER_ASSIGNED_TO_SUBSCRIPTION | EMAIL_SUCCEEDED | EMAIL_FAILED
        )
    }

    fn reduce(&mut self, event_type: &str, data: &Value) {
        match event_type {
            MEMBER_ASSIGNED_TO_SUBSCRIPTION => {
                let (Some(subscription_id), Some(member_id)) = (
                    data.get("subscriptionId").and_then(Value::as_str),
                    data.get("memberId").and_then(Value::as_str),
                ) else {
                    return;
                };
                self.next_id += 1;
                self.list.push(Notification {
                    id: format!("mail-{}", self.next_id),
                    subscription_id: subscription_id.to_string(),
                    member_id: member_id.to_string(),
                    attempt: 0,
                });
            }
            EMAIL_SUCCEEDED => {
                if let Some(id) = data.get("notificationId").and_then(Value::as_str) {
                    self.list.retain(|n| n.id != id);
                }
            }
            EMAIL_FAILED => {
                let Some(id) = data.get("notificationId").and_then(Value::as_str) else {
                    return;
                };
                if let Some(pos) = self.list.iter().position(|n| n.id == id) {
                    self.list[pos].attempt += 1;
                    if self.list[pos].attempt >= MAX_EMAIL_ATTEMPTS {
                        self.list.remove(pos);
                    }
                }
            }
            _ => {}
        }
    }

    fn value(&self) -> Value {
        serde_json::to_value(self).expect("notification queue serializes to JSON")
    }

    fn snapshot(&self) -> Box<dyn ViewState> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Outbound delivery transport.
///
/// The wire protocol (SendGrid or otherwise) lives entirely behind this
/// seam; the engine only observes success or failure.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Attempt to deliver one notification.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::Transport`] when delivery failed; the
    /// handler records the failure and retries on a later commit.
    async fn deliver(&self, notification: &Notification) -> Result<(), EffectError>;
}

/// Transport that records deliveries in the log and reports success.
///
/// Stands in where a deployment plugs its HTTP client.
pub struct LoggingMailer;

#[async_trait]
impl MailTransport for LoggingMailer {
    async fn deliver(&self, notification: &Notification) -> Result<(), EffectError> {
        tracing::info!(
            notification = %notification.id,
            member = %notification.member_id,
            subscription = %notification.subscription_id,
            "notification delivered"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EmailSender
// ---------------------------------------------------------------------------

/// Post-commit handler draining the notification queue.
///
/// Runs after every commit: reads `Emails.To.Send`, attempts delivery of
/// each queued notification, and ingests `Email.Succeeded` /
/// `Email.Failed` facts. Re-delivery of in-flight notifications across
/// overlapping invocations is possible; delivery is at least once and
/// the projection's attempt cap bounds the retries.
pub struct EmailSender {
    transport: Arc<dyn MailTransport>,
}

impl EmailSender {
    /// Build a sender over the given transport.
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EffectHandler for EmailSender {
    async fn on_commit(&self, _events: &[Event], engine: &Handle) -> Result<(), EffectError> {
        let Some(list) = engine
            .query(vec![EMAILS_TO_SEND.to_string(), "list".to_string()])
            .await?
        else {
            return Ok(());
        };
        let notifications: Vec<Notification> = match serde_json::from_value(list) {
            Ok(notifications) => notifications,
            Err(e) => {
                tracing::warn!(error = %e, "notification queue has unexpected shape");
                return Ok(());
            }
        };

        for notification in notifications {
            let outcome = self.transport.deliver(&notification).await;
            let event_type = match &outcome {
                Ok(()) => EMAIL_SUCCEEDED,
                Err(e) => {
                    tracing::warn!(
                        notification = %notification.id,
                        attempt = notification.attempt + 1,
                        error = %e,
                        "notification delivery failed"
                    );
                    EMAIL_FAILED
                }
            };

            let fact = EventDraft::new(
                subscription_partition(&notification.subscription_id),
                event_type,
                json!({
                    "notificationId": notification.id,
                    "subscriptionId": notification.subscription_id,
                    "memberId": notification.member_id,
                }),
            )
            .with_metadata(json!({"correlationId": Uuid::new_v4().to_string()}));

            engine.ingest(fact).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
