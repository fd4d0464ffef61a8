use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::token;

use super::availability::check_offered;
use super::{now_ms, Engine, EngineError, MentorLedger, WalCommand};

fn collaborator_err(e: std::io::Error) -> EngineError {
    EngineError::Collaborator(e.to_string())
}

impl Engine {
    /// Reserve `slot` with `mentor_id` for `mentee_id`. The booking starts PENDING
    /// with price and duration copied from the mentor's profile as of now.
    pub async fn create_booking(
        &self,
        mentee_id: Ulid,
        mentor_id: Ulid,
        slot: SlotKey,
        notes: Option<String>,
    ) -> Result<Booking, EngineError> {
        if let Some(ref n) = notes
            && n.len() > MAX_NOTES_LEN {
                return Err(EngineError::LimitExceeded("notes too long"));
            }

        let mentee = self
            .collaborators
            .accounts
            .account(mentee_id)
            .await
            .map_err(collaborator_err)?
            .ok_or(EngineError::NotFound(mentee_id))?;
        if mentee.role != Role::Mentee {
            return Err(EngineError::Unauthorized("only mentees can create bookings"));
        }

        let profile = self
            .collaborators
            .profiles
            .snapshot_for(mentor_id)
            .await
            .map_err(collaborator_err)?
            .filter(|p| p.active)
            .ok_or(EngineError::NotFound(mentor_id))?;

        let windows = self
            .collaborators
            .availability
            .windows_for(mentor_id)
            .await
            .map_err(collaborator_err)?;
        check_offered(&windows, mentor_id, &slot)?;

        let _gate = self.wal_gate.read().await;
        let ledger = self.ledger_for(mentor_id);
        let mut guard = ledger.write().await;
        if guard.held_count() >= MAX_LIVE_BOOKINGS_PER_MENTOR {
            return Err(EngineError::LimitExceeded("too many live bookings for mentor"));
        }

        // Check and insert under one write lock: no competing create can interleave.
        if let Err(e) = guard.check_slot_free(&slot) {
            metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
            debug!("slot conflict for mentor {mentor_id} at {slot}");
            return Err(e);
        }

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            mentor_id,
            mentor_account_id: profile.account_id,
            mentee_id,
            slot,
            duration: profile.session_duration,
            price: profile.session_price,
            status: BookingStatus::Pending,
            meeting_reference: None,
            notes,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!("booking {} created: mentor {mentor_id} at {slot}", booking.id);
        Ok(booking)
    }

    /// PENDING → CONFIRMED. Confirming an already CONFIRMED booking returns it
    /// unchanged so settlement retries are safe.
    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.wal_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;

        match booking.status {
            BookingStatus::Confirmed => {
                debug!("booking {id} already confirmed");
                return Ok(booking);
            }
            BookingStatus::Pending => {}
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    action: "confirm",
                });
            }
        }

        let confirmed = self.confirm_locked(&mut guard, id, None).await?;
        drop(guard);

        info!("booking {id} confirmed");
        self.dispatch_confirmation(confirmed.clone());
        Ok(confirmed)
    }

    /// Write the confirmation (optionally carrying the payment row) as one WAL
    /// record and return the updated booking. Caller holds the ledger lock and
    /// has checked the booking is PENDING.
    pub(super) async fn confirm_locked(
        &self,
        ledger: &mut MentorLedger,
        id: Ulid,
        payment: Option<Payment>,
    ) -> Result<Booking, EngineError> {
        let mentor_id = ledger.mentor_id;
        let meeting_reference = token::meeting_reference(&self.config.meeting_url_prefix);
        let at = now_ms();
        let event = match payment {
            Some(payment) => Event::PaymentSettled {
                mentor_id,
                payment,
                meeting_reference,
                at,
            },
            None => Event::BookingConfirmed {
                id,
                mentor_id,
                meeting_reference,
                at,
            },
        };
        self.persist_and_apply(ledger, &event).await?;
        ledger.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// PENDING or CONFIRMED → CANCELLED, by the booking's mentor or mentee.
    /// The slot is free for a new booking as soon as this returns.
    pub async fn cancel_booking(&self, id: Ulid, actor_id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.wal_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;

        if actor_id != booking.mentee_id && actor_id != booking.mentor_account_id {
            return Err(EngineError::Unauthorized(
                "only the booking's mentor or mentee may cancel it",
            ));
        }
        if booking.status.is_terminal() {
            return Err(EngineError::InvalidState {
                id,
                status: booking.status,
                action: "cancel",
            });
        }

        let event = Event::BookingCancelled {
            id,
            mentor_id: booking.mentor_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {id} cancelled by {actor_id} (was {})", booking.status);
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// CONFIRMED → COMPLETED once the session has taken place.
    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let _gate = self.wal_gate.read().await;
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;

        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidState {
                id,
                status: booking.status,
                action: "complete",
            });
        }

        let event = Event::BookingCompleted {
            id,
            mentor_id: booking.mentor_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("booking {id} completed");
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Compact the WAL down to one record per booking plus one per payment.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.wal_gate.write().await;

        let mut mentor_ids: Vec<Ulid> = self.ledgers.iter().map(|e| *e.key()).collect();
        mentor_ids.sort();

        let mut events = Vec::new();
        for mentor_id in mentor_ids {
            let Some(ledger) = self.get_ledger(&mentor_id) else {
                continue;
            };
            let guard = ledger.read().await;

            let mut bookings: Vec<&Booking> = guard.bookings().collect();
            bookings.sort_by_key(|b| b.id);
            for booking in bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }

            let mut payments: Vec<&Payment> = guard.payments().collect();
            payments.sort_by_key(|p| p.booking_id);
            for payment in payments {
                events.push(Event::PaymentRecorded {
                    mentor_id,
                    payment: payment.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
