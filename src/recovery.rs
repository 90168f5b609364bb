//! Startup recovery: rebuild all projections by replaying the log.
//!
//! Replay happens before the coordinator starts accepting work, so no
//! external input can interleave. Only [`Core::reduce`] runs; state
//! machines and post-commit effects never fire during replay, which is
//! what keeps historical external effects from being re-issued.

use crate::core::Core;
use crate::error::StorageError;
use crate::lss::SqliteReader;

/// Stream the full log through the core in `order_id` order.
///
/// Returns the number of events replayed. Afterwards the projections
/// equal what the live system had arrived at, and the reactive residue
/// of the replay (dirty markers, pre-change snapshots) is discarded so
/// the first live transaction starts clean.
///
/// # Errors
///
/// Returns [`StorageError`] if the scan fails or a persisted record
/// cannot be decoded; the core is left partially folded and must not be
/// used.
pub fn replay(core: &mut Core, reader: &SqliteReader) -> Result<u64, StorageError> {
    let mut count = 0u64;
    for record in reader.physical_read() {
        let event = record?;
        core.reduce(&event.event_type, &event.data);
        count += 1;
    }
    core.finish_recovery();
    tracing::info!(events = count, "log replay complete");
    Ok(count)
}
