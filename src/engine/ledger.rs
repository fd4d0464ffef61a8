use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Everything the engine owns for one mentor: booking rows, payment rows, and the
/// Slot Conflict Index derived from them.
///
/// Invariant: `slots` maps each slot to the single booking holding it, and holds
/// exactly the bookings whose status is not CANCELLED.
#[derive(Debug)]
pub struct MentorLedger {
    pub mentor_id: Ulid,
    bookings: HashMap<Ulid, Booking>,
    slots: HashMap<SlotKey, Ulid>,
    /// Keyed by booking id: at most one payment per booking.
    payments: HashMap<Ulid, Payment>,
}

impl MentorLedger {
    pub fn new(mentor_id: Ulid) -> Self {
        Self {
            mentor_id,
            bookings: HashMap::new(),
            slots: HashMap::new(),
            payments: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Number of slots currently held, i.e. non-cancelled bookings.
    pub fn held_count(&self) -> usize {
        self.slots.len()
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.get(id)
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.values()
    }

    pub fn payment_for(&self, booking_id: &Ulid) -> Option<&Payment> {
        self.payments.get(booking_id)
    }

    pub fn payments(&self) -> impl Iterator<Item = &Payment> {
        self.payments.values()
    }

    /// Slots in the conflict index, unordered.
    pub fn held(&self) -> impl Iterator<Item = &SlotKey> {
        self.slots.keys()
    }

    /// The booking currently holding `slot`, if any.
    pub fn holder(&self, slot: &SlotKey) -> Option<Ulid> {
        self.slots.get(slot).copied()
    }

    /// Reservation check. The caller must hold the ledger's write lock from this
    /// call until the new booking is applied.
    pub fn check_slot_free(&self, slot: &SlotKey) -> Result<(), EngineError> {
        match self.holder(slot) {
            Some(_) => Err(EngineError::SlotTaken {
                mentor_id: self.mentor_id,
                slot: *slot,
            }),
            None => Ok(()),
        }
    }

    pub(super) fn insert(&mut self, booking: Booking) {
        if booking.status.holds_slot() {
            self.slots.insert(booking.slot, booking.id);
        }
        self.bookings.insert(booking.id, booking);
    }

    /// Move a booking to `status`, releasing its slot on cancellation.
    pub(super) fn set_status(&mut self, id: &Ulid, status: BookingStatus, at: Ms) {
        let Some(booking) = self.bookings.get_mut(id) else {
            return;
        };
        booking.status = status;
        booking.updated_at = at;
        if !status.holds_slot() && self.slots.get(&booking.slot) == Some(id) {
            self.slots.remove(&booking.slot);
        }
    }

    pub(super) fn set_meeting_reference(&mut self, id: &Ulid, reference: String) {
        if let Some(booking) = self.bookings.get_mut(id) {
            booking.meeting_reference = Some(reference);
        }
    }

    pub(super) fn record_payment(&mut self, payment: Payment) {
        self.payments.insert(payment.booking_id, payment);
    }

    /// Panics unless the slot index holds exactly the non-cancelled rows.
    #[cfg(test)]
    pub(crate) fn assert_index_matches_rows(&self) {
        let mut live = 0;
        for b in self.bookings.values().filter(|b| b.status.holds_slot()) {
            assert_eq!(self.holder(&b.slot), Some(b.id), "row {} not indexed at {}", b.id, b.slot);
            live += 1;
        }
        assert_eq!(self.slots.len(), live, "index holds cancelled or missing rows");
    }
}
