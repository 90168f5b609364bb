//! Member assignment: the assignment commands, the tracker view, and the
//! state machine that drives pending members forward.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::{ChangeState, StateMachine, TriggerCtx, ViewState};
use crate::domain::email::{EMAIL_FAILED, EMAIL_SUCCEEDED, MAX_EMAIL_ATTEMPTS};
use crate::domain::subscription_partition;
use crate::error::CoreError;
use crate::event::{Command, EventDraft};

/// Command / change-state id starting an assignment batch.
pub const SUBSCRIPTION_ASSIGN_MEMBERS: &str = "Subscription.Assign.Members";
/// Emitted when an assignment batch starts.
pub const MEMBERS_ASSIGNMENT_STARTED: &str = "Members.AssignmentStarted";
/// Command / change-state id assigning a single member.
pub const MEMBER_ASSIGN: &str = "Member.Assign";
/// Emitted when one member joins a subscription.
pub const MEMBER_ASSIGNED_TO_SUBSCRIPTION: &str = "Member.AssignedToSubscription";
/// View id of the assignment tracker.
pub const ASSIGNMENT_TRACKER: &str = "Assignment.Tracker";

// ---------------------------------------------------------------------------
// Subscription.Assign.Members
// ---------------------------------------------------------------------------

/// Stateless change state turning a batch request into an
/// `Members.AssignmentStarted` fact.
#[derive(Debug, Clone)]
pub struct AssignMembers;

impl ChangeState for AssignMembers {
    fn view_id(&self) -> &'static str {
        SUBSCRIPTION_ASSIGN_MEMBERS
    }

    fn map(&self, data: &Value) -> Result<Vec<EventDraft>, CoreError> {
        let subscription_id = data
            .get("subscriptionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::mapper("Subscription.Assign.Members requires a string `subscriptionId`")
            })?;
        let members = data
            .get("members")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                CoreError::mapper("Subscription.Assign.Members requires a `members` array")
            })?;
        if members.iter().any(|m| !m.is_string()) {
            return Err(CoreError::mapper("`members` must contain only strings"));
        }

        Ok(vec![EventDraft::new(
            subscription_partition(subscription_id),
            MEMBERS_ASSIGNMENT_STARTED,
            json!({"subscriptionId": subscription_id, "members": members}),
        )])
    }

    fn handles(&self, _event_type: &str) -> bool {
        false
    }

    fn reduce(&mut self, _event_type: &str, _data: &Value) {}

    fn snapshot(&self) -> Box<dyn ChangeState> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Member.Assign
// ---------------------------------------------------------------------------

/// Change state assigning a single member, with replay-safe dedup.
///
/// The assignment machine naively re-issues `Member.Assign` for every
/// pending member each time the tracker is dirtied; this entry absorbs
/// the repeats by mapping already-assigned pairs to no events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberAssign {
    assigned: HashSet<(String, String)>,
}

impl ChangeState for MemberAssign {
    fn view_id(&self) -> &'static str {
        MEMBER_ASSIGN
    }

    fn map(&self, data: &Value) -> Result<Vec<EventDraft>, CoreError> {
        let subscription_id = data
            .get("subscriptionId")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::mapper("Member.Assign requires a string `subscriptionId`"))?;
        let member_id = data
            .get("memberId")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::mapper("Member.Assign requires a string `memberId`"))?;

        let pair = (subscription_id.to_string(), member_id.to_string());
        if self.assigned.contains(&pair) {
            return Ok(vec![]);
        }

        Ok(vec![EventDraft::new(
            subscription_partition(subscription_id),
            MEMBER_ASSIGNED_TO_SUBSCRIPTION,
            json!({"subscriptionId": subscription_id, "memberId": member_id}),
        )])
    }

    fn handles(&self, event_type: &str) -> bool {
        event_type == MEMBER_ASSIGNED_TO_SUBSCRIPTION
    }

    fn reduce(&mut self, _event_type: &str, data: &Value) {
        if let (Some(subscription_id), Some(member_id)) = (
            data.get("subscriptionId").and_then(Value::as_str),
            data.get("memberId").and_then(Value::as_str),
        ) {
            self.assigned
                .insert((subscription_id.to_string(), member_id.to_string()));
        }
    }

    fn snapshot(&self) -> Box<dyn ChangeState> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Assignment.Tracker
// ---------------------------------------------------------------------------

/// Per-subscription assignment progress.
///
/// Members stay `pending` until their notification is delivered
/// (`Email.Succeeded`) and move to `failed` when delivery exhausts its
/// attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerEntry {
    /// Members whose assignment is in flight, in batch order.
    pub pending: Vec<String>,
    /// Members whose notification was delivered.
    pub completed: Vec<String>,
    /// Members whose notification exhausted its delivery attempts.
    pub failed: Vec<String>,
    /// Delivery failures observed per member.
    pub failure_counts: HashMap<String, u64>,
}

/// View of assignment progress keyed by subscription id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentTracker {
    subscriptions: HashMap<String, TrackerEntry>,
}

impl AssignmentTracker {
    fn entry_for(&mut self, data: &Value) -> Option<(&mut TrackerEntry, String)> {
        let subscription_id = data.get("subscriptionId").and_then(Value::as_str)?;
        let member_id = data.get("memberId").and_then(Value::as_str)?.to_string();
        let entry = self.subscriptions.get_mut(subscription_id)?;
        Some((entry, member_id))
    }
}

impl ViewState for AssignmentTracker {
    fn view_id(&self) -> &'static str {
        ASSIGNMENT_TRACKER
    }

    fn handles(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            MEMBERS_ASSIGNMENT_STARTED | EMAIL_SUCCEEDED | EMAIL_FAILED
        )
    }

    fn reduce(&mut self, event_type: &str, data: &Value) {
        match event_type {
            MEMBERS_ASSIGNMENT_STARTED => {
                let Some(subscription_id) = data.get("subscriptionId").and_then(Value::as_str)
                else {
                    return;
                };
                let entry = self
                    .subscriptions
                    .entry(subscription_id.to_string())
                    .or_default();
                let members = data
                    .get("members")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for member in members.iter().filter_map(Value::as_str) {
                    let known = |list: &[String]| list.iter().any(|m| m == member);
                    if !known(&entry.pending) && !known(&entry.completed) && !known(&entry.failed) {
                        entry.pending.push(member.to_string());
                    }
                }
            }
            EMAIL_SUCCEEDED => {
                if let Some((entry, member)) = self.entry_for(data)
                    && let Some(pos) = entry.pending.iter().position(|m| *m == member)
                {
                    entry.pending.remove(pos);
                    entry.completed.push(member);
                }
            }
            EMAIL_FAILED => {
                if let Some((entry, member)) = self.entry_for(data) {
                    let failures = {
                        let counter = entry.failure_counts.entry(member.clone()).or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    if failures >= MAX_EMAIL_ATTEMPTS
                        && let Some(pos) = entry.pending.iter().position(|m| *m == member)
                    {
                        entry.pending.remove(pos);
                        entry.failed.push(member);
                    }
                }
            }
            _ => {}
        }
    }

    fn value(&self) -> Value {
        serde_json::to_value(&self.subscriptions).expect("assignment tracker serializes to JSON")
    }

    fn snapshot(&self) -> Box<dyn ViewState> {
        Box::new(self.clone())
    }
}

// ---------------------------------------------------------------------------
// Assignment machine
// ---------------------------------------------------------------------------

/// Re-issues `Member.Assign` for every pending member whenever the
/// tracker changes.
///
/// Deliberately naive: it reads only the current view and does not
/// remember what it already issued, so repeats for in-flight members are
/// expected and absorbed by [`MemberAssign`]'s dedup.
pub struct AssignmentMachine;

impl StateMachine for AssignmentMachine {
    fn view_id(&self) -> &'static str {
        ASSIGNMENT_TRACKER
    }

    fn trigger(&self, tx: &mut TriggerCtx<'_>) -> Result<(), CoreError> {
        let Some(Value::Object(subscriptions)) = tx.query(&[ASSIGNMENT_TRACKER]) else {
            return Ok(());
        };
        for (subscription_id, entry) in subscriptions {
            let Some(pending) = entry.get("pending").and_then(Value::as_array) else {
                continue;
            };
            for member in pending.iter().filter_map(Value::as_str) {
                tx.produce(&Command::new(
                    MEMBER_ASSIGN,
                    json!({"subscriptionId": subscription_id, "memberId": member}),
                ))?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
