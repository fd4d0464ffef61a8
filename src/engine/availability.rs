use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// A slot is offered iff some declared window covers its weekday and start time.
/// Runs before any reservation attempt and never touches the conflict index.
pub fn check_offered(
    windows: &[AvailabilityWindow],
    mentor_id: Ulid,
    slot: &SlotKey,
) -> Result<(), EngineError> {
    if windows.iter().any(|w| w.offers(slot)) {
        Ok(())
    } else {
        Err(EngineError::SlotNotOffered {
            mentor_id,
            slot: *slot,
        })
    }
}
