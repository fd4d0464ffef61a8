use std::cmp::Ordering;
use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Newest slot first; booking id breaks ties so equal slots (a cancelled booking
/// and its replacement) always list in the same order.
fn schedule_order(a: &Booking, b: &Booking) -> Ordering {
    b.slot.cmp(&a.slot).then_with(|| b.id.cmp(&a.id))
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mentor_id = self
            .mentor_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ledger = self
            .get_ledger(&mentor_id)
            .ok_or(EngineError::NotFound(mentor_id))?;
        let guard = ledger.read().await;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// All bookings for a mentor, any status, newest slot first.
    pub async fn list_bookings_for_mentor(&self, mentor_id: Ulid) -> Vec<Booking> {
        let Some(ledger) = self.get_ledger(&mentor_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        let mut bookings: Vec<Booking> = guard.bookings().cloned().collect();
        bookings.sort_by(schedule_order);
        bookings
    }

    /// All bookings made by a mentee, any status, newest slot first.
    pub async fn list_bookings_for_mentee(&self, mentee_id: Ulid) -> Vec<Booking> {
        let ids = self
            .mentee_bookings
            .get(&mentee_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut by_mentor: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for id in ids {
            if let Some(mentor_id) = self.mentor_for_booking(&id) {
                by_mentor.entry(mentor_id).or_default().push(id);
            }
        }

        let mut bookings = Vec::new();
        for (mentor_id, ids) in by_mentor {
            let Some(ledger) = self.get_ledger(&mentor_id) else {
                continue;
            };
            let guard = ledger.read().await;
            bookings.extend(ids.iter().filter_map(|id| guard.booking(id).cloned()));
        }
        bookings.sort_by(schedule_order);
        bookings
    }

    /// Non-cancelled slots currently held for a mentor, ascending.
    pub async fn held_slots(&self, mentor_id: Ulid) -> Vec<SlotKey> {
        let Some(ledger) = self.get_ledger(&mentor_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        let mut slots: Vec<SlotKey> = guard.held().copied().collect();
        slots.sort();
        slots
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_mentor.len()
    }
}
