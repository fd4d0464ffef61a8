mod availability;
mod error;
mod ledger;
mod mutations;
mod queries;
mod settlement;
#[cfg(test)]
mod tests;

pub use availability::check_offered;
pub use error::{EngineError, ErrorKind};
pub use ledger::MentorLedger;
pub use settlement::DEFAULT_PAYMENT_METHOD;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::directory::{AccountDirectory, AvailabilityStore, InMemoryDirectory, MentorProfileStore};
use crate::model::*;
use crate::notify::NotificationSink;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<MentorLedger>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Append and fsync the whole batch. On any failure the batch is rolled back
/// out of the file so a record whose caller saw an error never replays.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        roll_back(wal);
    }
    result
}

fn roll_back(wal: &mut Wal) {
    if let Err(e) = wal.rollback() {
        error!("WAL rollback failed, unacknowledged records may replay: {e}");
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            if result.is_err() {
                roll_back(wal);
            }
            let _ = response.send(result);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Deployment-level settings the engine stamps onto records.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub currency: String,
    pub meeting_url_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: "INR".into(),
            meeting_url_prefix: "https://meet.jit.si/mentorconnect-".into(),
        }
    }
}

/// Read-only inputs and the outbound notice sink.
#[derive(Clone)]
pub struct Collaborators {
    pub availability: Arc<dyn AvailabilityStore>,
    pub profiles: Arc<dyn MentorProfileStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Collaborators {
    pub fn in_memory(directory: Arc<InMemoryDirectory>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            availability: directory.clone(),
            profiles: directory.clone(),
            accounts: directory,
            notifier,
        }
    }
}

pub struct Engine {
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared for their WAL append; compaction holds it
    /// exclusively so no append can slip between snapshot and swap.
    pub(super) wal_gate: RwLock<()>,
    /// Reverse lookup: booking id → mentor id.
    pub(super) booking_to_mentor: DashMap<Ulid, Ulid>,
    /// Mentee → booking ids, in creation order.
    pub(super) mentee_bookings: DashMap<Ulid, Vec<Ulid>>,
    pub(super) collaborators: Collaborators,
    pub(super) config: EngineConfig,
}

/// Apply an event to a ledger (no locking; caller holds the write lock).
fn apply_to_ledger(
    ledger: &mut MentorLedger,
    event: &Event,
    booking_index: &DashMap<Ulid, Ulid>,
    mentee_index: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::BookingCreated { booking } => {
            booking_index.insert(booking.id, booking.mentor_id);
            let mut ids = mentee_index.entry(booking.mentee_id).or_default();
            if !ids.contains(&booking.id) {
                ids.push(booking.id);
            }
            drop(ids);
            ledger.insert(booking.clone());
        }
        Event::BookingConfirmed {
            id,
            meeting_reference,
            at,
            ..
        } => {
            ledger.set_meeting_reference(id, meeting_reference.clone());
            ledger.set_status(id, BookingStatus::Confirmed, *at);
        }
        Event::PaymentSettled {
            payment,
            meeting_reference,
            at,
            ..
        } => {
            let id = payment.booking_id;
            ledger.record_payment(payment.clone());
            ledger.set_meeting_reference(&id, meeting_reference.clone());
            ledger.set_status(&id, BookingStatus::Confirmed, *at);
        }
        Event::BookingCancelled { id, at, .. } => {
            ledger.set_status(id, BookingStatus::Cancelled, *at);
        }
        Event::BookingCompleted { id, at, .. } => {
            ledger.set_status(id, BookingStatus::Completed, *at);
        }
        Event::PaymentRecorded { payment, .. } => {
            ledger.record_payment(payment.clone());
        }
    }
}

impl Engine {
    /// Open the engine over `wal_path`, replaying it to rebuild every ledger.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, collaborators: Collaborators, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            ledgers: DashMap::new(),
            wal_tx,
            wal_gate: RwLock::new(()),
            booking_to_mentor: DashMap::new(),
            mentee_bookings: DashMap::new(),
            collaborators,
            config,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never block here: this may run inside an async context.
        let mut orphans = 0usize;
        for event in &events {
            let ledger = engine.ledger_for(event.mentor_id());
            let Ok(mut guard) = ledger.try_write() else {
                orphans += 1;
                continue;
            };
            if matches!(event, Event::BookingCreated { .. }) || references_known_booking(&guard, event) {
                apply_to_ledger(&mut guard, event, &engine.booking_to_mentor, &engine.mentee_bookings);
            } else {
                orphans += 1;
            }
        }
        if orphans > 0 {
            warn!("WAL replay skipped {orphans} events for unknown bookings");
        }
        info!(
            "engine ready: {} events replayed, {} mentors, {} bookings",
            events.len(),
            engine.ledgers.len(),
            engine.booking_to_mentor.len()
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Ledger for a mentor, created empty on first use.
    pub(super) fn ledger_for(&self, mentor_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(mentor_id)
            .or_insert_with(|| Arc::new(RwLock::new(MentorLedger::new(mentor_id))))
            .value()
            .clone()
    }

    pub fn get_ledger(&self, mentor_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(mentor_id).map(|e| e.value().clone())
    }

    pub fn mentor_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_mentor.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append then apply. Memory changes only once the record is durable.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut MentorLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(ledger, event, &self.booking_to_mentor, &self.mentee_bookings);
        Ok(())
    }

    /// Lookup booking → mentor, acquire that mentor's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<MentorLedger>, EngineError> {
        let mentor_id = self
            .mentor_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ledger = self
            .get_ledger(&mentor_id)
            .ok_or(EngineError::NotFound(mentor_id))?;
        Ok(ledger.write_owned().await)
    }

    /// Fire-and-forget delivery of the confirmation notice. Failures are logged
    /// and counted; they never reach the caller.
    pub(super) fn dispatch_confirmation(&self, booking: Booking) {
        let accounts = self.collaborators.accounts.clone();
        let sink = self.collaborators.notifier.clone();
        tokio::spawn(async move {
            match deliver_confirmation(accounts.as_ref(), sink.as_ref(), &booking).await {
                Ok(()) => {
                    debug!("confirmation notice sent for booking {}", booking.id);
                    metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "ok")
                        .increment(1);
                }
                Err(e) => {
                    warn!("confirmation notice for booking {} not delivered: {e}", booking.id);
                    metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "status" => "failed")
                        .increment(1);
                }
            }
        });
    }
}

/// Booking an event acts on.
fn event_booking_id(event: &Event) -> Ulid {
    match event {
        Event::BookingCreated { booking } => booking.id,
        Event::BookingConfirmed { id, .. }
        | Event::BookingCancelled { id, .. }
        | Event::BookingCompleted { id, .. } => *id,
        Event::PaymentSettled { payment, .. } | Event::PaymentRecorded { payment, .. } => {
            payment.booking_id
        }
    }
}

fn references_known_booking(ledger: &MentorLedger, event: &Event) -> bool {
    ledger.booking(&event_booking_id(event)).is_some()
}

async fn deliver_confirmation(
    accounts: &dyn AccountDirectory,
    sink: &dyn NotificationSink,
    booking: &Booking,
) -> io::Result<()> {
    let missing = |what: &str, id: Ulid| io::Error::new(io::ErrorKind::NotFound, format!("{what} {id} not found"));

    let mentor = accounts
        .account(booking.mentor_account_id)
        .await?
        .ok_or_else(|| missing("mentor account", booking.mentor_account_id))?;
    let mentee = accounts
        .account(booking.mentee_id)
        .await?
        .ok_or_else(|| missing("mentee account", booking.mentee_id))?;
    let meeting_reference = booking
        .meeting_reference
        .clone()
        .ok_or_else(|| missing("meeting reference for booking", booking.id))?;

    let notice = ConfirmationNotice {
        booking_id: booking.id,
        mentor_contact: mentor.contact,
        mentee_contact: mentee.contact,
        date: booking.slot.date,
        time: booking.slot.time,
        duration: booking.duration,
        price: booking.price,
        meeting_reference,
        notes: booking.notes.clone(),
    };
    sink.deliver([mentor.id, mentee.id], &notice).await
}
