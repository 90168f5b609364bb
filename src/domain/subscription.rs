//! Subscription creation and the subscription list view.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::{ChangeState, ViewState};
use crate::domain::assignment::MEMBER_ASSIGNED_TO_SUBSCRIPTION;
use crate::domain::subscription_partition;
use crate::error::CoreError;
use crate::event::EventDraft;

/// Command / change-state id for creating subscriptions.
pub const SUBSCRIPTION_CREATE: &str = "Subscription.Create";
/// Emitted once per created subscription.
pub const SUBSCRIPTION_CREATED: &str = "Subscription.Created";
/// View id of the subscription list.
pub const SUBSCRIPTION_LIST: &str = "Subscription.List";

// ---------------------------------------------------------------------------
// Subscription.Create
// ---------------------------------------------------------------------------

/// Change state allocating subscription ids.
///
/// `next_id` is derived exclusively from the fold of `Subscription.Created`
/// events; the mapper reads it but never advances it, so rollback and
/// replay reproduce the same ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionCreate {
    next_id: u64,
}

impl ChangeState for SubscriptionCreate {
    fn view_id(&self) -> &'static str {
        SUBSCRIPTION_CREATE
    }

    fn map(&self, data: &Value) -> Result<Vec<EventDraft>, CoreError> {
        let plan = data
            .get("plan")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::mapper("Subscription.Create requires a string `plan`"))?;
        let created_by = data.get("createdBy").and_then(Value::as_str).ok_or_else(|| {
            CoreError::mapper("Subscription.Create requires a string `createdBy`")
        })?;

        let subscription_id = format!("sub-{}", self.next_id + 1);
        Ok(vec![EventDraft::new(
            subscription_partition(&subscription_id),
            SUBSCRIPTION_CREATED,
            json!({
                "subscriptionId": subscription_id,
                "plan": plan,
                "createdBy": created_by,
            }),
        )])
    }

    fn handles(&self, event_type: &str) -> bool {
        event_type == SUBSCRIPTION_CREATED
    }

    fn reduce(&mut self, _event_type: &str, _data: &Value) {
        self.next_id += 1;
    }

    fn snapshot(&self) -> Box<dyn ChangeState> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Subscription.List
// ---------------------------------------------------------------------------

/// One subscription as seen by queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEntry {
    /// Plan name chosen at creation.
    pub plan: String,
    /// Identity that issued the create command.
    pub created_by: String,
    /// Members assigned so far, in assignment order.
    pub members: Vec<String>,
}

/// View of all subscriptions keyed by subscription id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionList {
    entries: HashMap<String, SubscriptionEntry>,
}

impl ViewState for SubscriptionList {
    fn view_id(&self) -> &'static str {
        SUBSCRIPTION_LIST
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            SUBSCRIPTION_CREATED | MEMBER_ASSIGNED_TO_SUBSCRIPTION
        )
    }

    fn reduce(&mut self, event_type: &str, data: &Value) {
        let Some(subscription_id) = data.get("subscriptionId").and_then(Value::as_str) else {
            return;
        };
        match event_type {
            SUBSCRIPTION_CREATED => {
                let entry = SubscriptionEntry {
                    plan: data
                        .get("plan")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    created_by: data
                        .get("createdBy")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    members: Vec::new(),
                };
                self.entries.insert(subscription_id.to_string(), entry);
            }
            MEMBER_ASSIGNED_TO_SUBSCRIPTION => {
                if let Some(entry) = self.entries.get_mut(subscription_id)
                    && let Some(member) = data.get("memberId").and_then(Value::as_str)
                    && !entry.members.iter().any(|m| m == member)
                {
                    entry.members.push(member.to_string());
                }
            }
            _ => {}
        }
    }

    fn value(&self) -> Value {
        serde_json::to_value(&self.entries).expect("subscription list serializes to JSON")
    }

    fn snapshot(&self) -> Box<dyn ViewState> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
