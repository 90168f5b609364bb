//! Post-commit effect fan-out.
//!
//! Effect handlers are registered on the engine and invoked by the
//! coordinator after each durable commit, outside the serialization
//! token. A handler reads projections through [`Handle::query`] and
//! feeds outcomes back as facts through [`Handle::ingest`]; it never
//! touches the core directly, so a handler failure cannot corrupt the
//! committed transaction.

use async_trait::async_trait;

use crate::coordinator::Handle;
use crate::error::EffectError;
use crate::event::Event;

/// A post-commit callback.
///
/// # Contract
///
/// - Invoked after the append durably succeeded and the committing
///   caller was notified; once per commit, including empty ones.
/// - Runs concurrently with subsequent transactions; all reads and
///   writes must go back through the coordinator handle.
/// - Delivery is at least once. Handlers must tolerate observing the
///   same projection entry across multiple invocations and record retry
///   bookkeeping in a projection, not in handler state.
#[async_trait]
pub trait EffectHandler: Send + Sync {
    /// React to a committed transaction.
    ///
    /// # Errors
    ///
    /// Errors are logged by the coordinator and otherwise ignored;
    /// meaningful failures should instead be ingested as compensating
    /// events (e.g. `Email.Failed`).
    async fn on_commit(&self, events: &[Event], engine: &Handle) -> Result<(), EffectError>;
}

/// Effect registered when no outbound transport is configured.
///
/// Keeps the fan-out wiring identical between configurations; commits
/// simply have no outbound consequences.
pub struct NoopEffect;

#[async_trait]
impl EffectHandler for NoopEffect {
    async fn on_commit(&self, events: &[Event], _engine: &Handle) -> Result<(), EffectError> {
        tracing::trace!(count = events.len(), "no-op effect fan-out");
        Ok(())
    }
}
