//! Commands, event drafts, and durable event records.
//!
//! This module provides the foundational data types that the core,
//! coordinator, and store modules all depend on. No I/O occurs here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Partition that holds engine-internal records such as the bootstrap event.
pub const SYSTEM_PARTITION: &str = "system";

/// Type tag of the bootstrap record seeded into an empty store.
pub const BOOTSTRAP_EVENT: &str = "LSS.Initialized";

/// Maximum byte length of `partition_id` and `event_type` fields.
///
/// Matches the column constraints of the durable record shape; the writer
/// rejects oversized fields before touching the database.
pub const MAX_TAG_LEN: usize = 255;

/// An in-memory request interpreted by a change-state mapper into events.
///
/// Commands are never persisted directly; they are reified as the events
/// the mapper yields. The `kind` field names a registered change-state
/// entry (e.g. `"Subscription.Create"`).
///
/// # Examples
///
/// ```
/// use logfold::Command;
/// use serde_json::json;
///
/// let cmd = Command::new("Subscription.Create", json!({"plan": "gold"}));
/// assert_eq!(cmd.kind, "Subscription.Create");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Command type tag; must match a registered change-state `view_id`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Structured payload, schema per command type.
    pub data: Value,
}

impl Command {
    /// Build a command from a type tag and payload.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// An event as emitted by a mapper, before the writer has assigned it a
/// position in the log.
///
/// Drafts accumulate in the core's transaction buffer. On commit the
/// coordinator hands the whole buffer to
/// [`LogWriter::physical_append`](crate::lss::LogWriter::physical_append),
/// which assigns `order_id`s, stamps the append time, and returns the
/// durable [`Event`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Groups related events for partition-ordered reads.
    #[serde(rename = "partitionId")]
    pub partition_id: String,
    /// Type tag from the closed event vocabulary (e.g. `Subscription.Created`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Structured payload, schema per event type.
    pub data: Value,
    /// Structured metadata; the writer stamps `appendTime` here at append.
    pub metadata: Value,
}

impl EventDraft {
    /// Build a draft with empty-object metadata.
    pub fn new(partition_id: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            partition_id: partition_id.into(),
            event_type: event_type.into(),
            data,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    /// Replace the draft's metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A durable record of the log-structured store.
///
/// `order_id` is assigned by the writer at append time and is strictly
/// increasing and globally unique. Within one `partition_id`, ordering by
/// `order_id` reflects causal order. Records are append-only and immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing position in the total order of the log.
    #[serde(rename = "orderId")]
    pub order_id: i64,
    /// Groups related events for partition-ordered reads.
    #[serde(rename = "partitionId")]
    pub partition_id: String,
    /// Type tag from the closed event vocabulary.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Structured payload.
    pub data: Value,
    /// Structured metadata, including the writer's `appendTime` stamp.
    pub metadata: Value,
}
