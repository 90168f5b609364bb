//! Crate-level error types for the core, the store, and job submission.

/// Error produced inside the functional core during a critical section.
///
/// All variants are locally recoverable: the coordinator rolls the
/// transaction back and continues with the next job.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No change-state entry matches the command type.
    #[error("unknown command type: {command_type}")]
    UnknownCommand {
        /// The unmatched command type tag.
        command_type: String,
    },

    /// A mapper rejected its input or could not produce events.
    #[error("mapper failure: {message}")]
    Mapper {
        /// Human-readable description of what the mapper rejected.
        message: String,
    },

    /// The state-machine fixpoint exceeded the recursion cap.
    ///
    /// Trigger termination is an application-level obligation; the depth
    /// cap turns a runaway fixpoint into a rolled-back transaction
    /// instead of a stack overflow.
    #[error("state-machine fixpoint exceeded depth {depth}")]
    FixpointOverflow {
        /// The depth at which the cap was hit.
        depth: u32,
    },
}

impl CoreError {
    /// Build a [`CoreError::Mapper`] from any displayable message.
    pub fn mapper(message: impl Into<String>) -> Self {
        Self::Mapper {
            message: message.into(),
        }
    }
}

/// Error surfaced by the log-structured store.
///
/// An append failure is fatal for the engine: in-memory state can no
/// longer be reconciled with the log, so the coordinator stops and the
/// process exits non-zero. Read failures are surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying SQLite failure (I/O, constraint, corruption).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure while preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be encoded or decoded as JSON.
    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// `logical_read_first`/`logical_read_last` on a partition with no events.
    #[error("empty partition: {partition_id}")]
    EmptyPartition {
        /// The partition that held no events.
        partition_id: String,
    },

    /// A `partition_id` or `type` field exceeded the column limit.
    #[error("{field} exceeds {limit} bytes")]
    OversizedField {
        /// Name of the offending field.
        field: &'static str,
        /// The byte limit that was exceeded.
        limit: usize,
    },
}

/// Error returned to callers of [`Handle::submit`](crate::coordinator::Handle::submit).
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The critical section failed; the transaction was rolled back and
    /// the coordinator continues with the next job.
    #[error(transparent)]
    Rejected(#[from] CoreError),

    /// The durable append failed. The coordinator has stopped; the
    /// process must exit and recover from the log on restart.
    #[error("durable append failed: {0}")]
    Fatal(#[source] StorageError),

    /// The coordinator is no longer accepting work.
    #[error("coordinator is no longer running")]
    Stopped,
}

/// Error surfaced by the built-in `--test-mode` self-check.
#[derive(Debug, thiserror::Error)]
pub enum SelfCheckError {
    /// A verification step did not hold.
    #[error("self-check assertion failed: {0}")]
    Assertion(String),

    /// A submitted job failed.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// The throwaway store could not be opened or replayed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error reported by a post-commit effect callback.
///
/// Effect failures never affect the committed transaction; they surface
/// as compensating events submitted back through the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    /// The outbound transport reported a delivery failure.
    #[error("effect transport failure: {0}")]
    Transport(String),

    /// Submitting a follow-up fact back through the coordinator failed.
    #[error(transparent)]
    Submit(#[from] SubmitError),
}
