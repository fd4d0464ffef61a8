use super::*;
use crate::limits::*;
use crate::notify::NotifyHub;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use tokio_test::{assert_err, assert_ok};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("mentorbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// 2024-01-01 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn slot(h: u32, m: u32) -> SlotKey {
    SlotKey::new(monday(), time(h, m))
}

fn register(directory: &InMemoryDirectory, role: Role, contact: &str) -> Ulid {
    let id = Ulid::new();
    directory
        .register_account(Account {
            id,
            role,
            contact: contact.into(),
        })
        .unwrap();
    id
}

/// Sink that refuses every notice.
struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn deliver(&self, _: [Ulid; 2], _: &ConfirmationNotice) -> io::Result<()> {
        Err(io::Error::other("mail relay down"))
    }
}

struct Fixture {
    directory: Arc<InMemoryDirectory>,
    hub: Arc<NotifyHub>,
    engine: Arc<Engine>,
    wal_path: PathBuf,
    mentor_id: Ulid,
    mentor_account: Ulid,
    mentee: Ulid,
}

impl Fixture {
    /// Mentor with a Monday 10:00-11:00 window at 500 per 45-minute session,
    /// plus one registered mentee.
    fn new(name: &str) -> Self {
        Self::with_sink(name, None)
    }

    fn with_sink(name: &str, sink: Option<Arc<dyn NotificationSink>>) -> Self {
        let wal_path = test_wal_path(name);
        let directory = Arc::new(InMemoryDirectory::new());
        let hub = Arc::new(NotifyHub::new());

        let mentor_account = register(&directory, Role::Mentor, "mentor@example.com");
        let mentee = register(&directory, Role::Mentee, "mentee@example.com");
        let mentor_id = Ulid::new();
        directory
            .upsert_mentor(mentor_id, mentor_account, Decimal::new(500, 0), Some(45), true)
            .unwrap();
        directory
            .replace_availability(
                mentor_id,
                vec![AvailabilityWindow::new(Weekday::Mon, time(10, 0), time(11, 0))],
            )
            .unwrap();

        let notifier: Arc<dyn NotificationSink> = match sink {
            Some(sink) => sink,
            None => hub.clone(),
        };
        let engine = Engine::new(
            wal_path.clone(),
            Collaborators::in_memory(directory.clone(), notifier),
            EngineConfig::default(),
        )
        .unwrap();

        Self {
            directory,
            hub,
            engine: Arc::new(engine),
            wal_path,
            mentor_id,
            mentor_account,
            mentee,
        }
    }

    /// A fresh engine replaying the same WAL against the same directory.
    fn reopen(&self) -> Engine {
        Engine::new(
            self.wal_path.clone(),
            Collaborators::in_memory(self.directory.clone(), self.hub.clone()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    fn another_mentee(&self) -> Ulid {
        register(&self.directory, Role::Mentee, "other@example.com")
    }

    async fn book(&self, mentee: Ulid, at: SlotKey) -> Result<Booking, EngineError> {
        self.engine.create_booking(mentee, self.mentor_id, at, None).await
    }
}

// ── End-to-end scenarios ─────────────────────────────────

#[tokio::test]
async fn scenario_create_pending_with_snapshot() {
    let fx = Fixture::new("scenario_a.wal");
    let b = assert_ok!(
        fx.engine
            .create_booking(fx.mentee, fx.mentor_id, slot(10, 30), Some("system design".into()))
            .await
    );
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.price, Decimal::new(500, 0));
    assert_eq!(b.duration, 45);
    assert_eq!(b.mentor_account_id, fx.mentor_account);
    assert_eq!(b.notes.as_deref(), Some("system design"));
    assert!(b.meeting_reference.is_none());
    assert_eq!(fx.engine.get_booking(b.id).await.unwrap(), b);
}

#[tokio::test]
async fn scenario_second_mentee_conflicts() {
    let fx = Fixture::new("scenario_b.wal");
    let first = fx.book(fx.mentee, slot(10, 30)).await.unwrap();

    let other = fx.another_mentee();
    let err = assert_err!(fx.book(other, slot(10, 30)).await);
    assert!(matches!(err, EngineError::SlotTaken { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // No record was created for the loser.
    assert_eq!(fx.engine.booking_count(), 1);
    assert!(fx.engine.list_bookings_for_mentee(other).await.is_empty());
    assert_eq!(fx.engine.list_bookings_for_mentor(fx.mentor_id).await, vec![first]);
}

#[tokio::test]
async fn scenario_settle_confirms() {
    let fx = Fixture::new("scenario_c.wal");
    let b = fx.book(fx.mentee, slot(10, 30)).await.unwrap();

    let payment = assert_ok!(fx.engine.settle_payment(b.id, None).await);
    assert_eq!(payment.status, PaymentStatus::Success);
    assert_eq!(payment.booking_id, b.id);
    assert_eq!(payment.amount, Decimal::new(500, 0));
    assert_eq!(payment.currency, "INR");
    assert_eq!(payment.method, DEFAULT_PAYMENT_METHOD);
    assert!(payment.transaction_reference.starts_with("DEMO_"));

    let confirmed = fx.engine.get_booking(b.id).await.unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    let reference = confirmed.meeting_reference.unwrap();
    assert!(reference.starts_with("https://meet.jit.si/mentorconnect-"));

    assert_eq!(fx.engine.get_payment_for_booking(b.id).await.unwrap(), payment);
}

#[tokio::test]
async fn scenario_cancel_confirmed_frees_slot() {
    let fx = Fixture::new("scenario_d.wal");
    let b = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    fx.engine.settle_payment(b.id, None).await.unwrap();

    let cancelled = assert_ok!(fx.engine.cancel_booking(b.id, fx.mentee).await);
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    // No refund: the payment row stays.
    assert!(fx.engine.get_payment_for_booking(b.id).await.is_ok());

    let other = fx.another_mentee();
    let rebooked = assert_ok!(fx.book(other, slot(10, 30)).await);
    assert_eq!(rebooked.status, BookingStatus::Pending);
    assert_eq!(fx.engine.held_slots(fx.mentor_id).await, vec![slot(10, 30)]);
}

#[tokio::test]
async fn scenario_outside_window_not_offered() {
    let fx = Fixture::new("scenario_e.wal");
    let err = assert_err!(fx.book(fx.mentee, slot(9, 0)).await);
    assert!(matches!(err, EngineError::SlotNotOffered { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);
    // Refused before the mentor's ledger was ever touched.
    assert!(fx.engine.get_ledger(&fx.mentor_id).is_none());
}

#[tokio::test]
async fn window_end_is_exclusive() {
    let fx = Fixture::new("window_end.wal");
    assert!(matches!(
        fx.book(fx.mentee, slot(11, 0)).await,
        Err(EngineError::SlotNotOffered { .. })
    ));
    let tuesday = SlotKey::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), time(10, 0));
    assert!(matches!(
        fx.book(fx.mentee, tuesday).await,
        Err(EngineError::SlotNotOffered { .. })
    ));
    assert_ok!(fx.book(fx.mentee, slot(10, 59)).await);
}

// ── Creation preconditions ───────────────────────────────

#[tokio::test]
async fn create_rejects_mentor_role() {
    let fx = Fixture::new("create_mentor_role.wal");
    let err = assert_err!(fx.book(fx.mentor_account, slot(10, 0)).await);
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn mentor_account_cannot_be_reregistered_as_mentee() {
    let fx = Fixture::new("reregister.wal");
    let err = assert_err!(fx.directory.register_account(Account {
        id: fx.mentor_account,
        role: Role::Mentee,
        contact: "mentor@example.com".into(),
    }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = assert_err!(
        fx.engine
            .create_booking(fx.mentor_account, fx.mentor_id, slot(10, 0), None)
            .await
    );
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert!(fx.engine.held_slots(fx.mentor_id).await.is_empty());
}

#[tokio::test]
async fn create_unknown_mentee_not_found() {
    let fx = Fixture::new("create_unknown_mentee.wal");
    let ghost = Ulid::new();
    let err = assert_err!(fx.book(ghost, slot(10, 0)).await);
    assert!(matches!(err, EngineError::NotFound(id) if id == ghost));
}

#[tokio::test]
async fn create_inactive_or_unknown_mentor_not_found() {
    let fx = Fixture::new("create_inactive.wal");
    let err = assert_err!(
        fx.engine
            .create_booking(fx.mentee, Ulid::new(), slot(10, 0), None)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::NotFound);

    fx.directory
        .upsert_mentor(fx.mentor_id, fx.mentor_account, Decimal::new(500, 0), Some(45), false)
        .unwrap();
    let err = assert_err!(fx.book(fx.mentee, slot(10, 0)).await);
    assert!(matches!(err, EngineError::NotFound(id) if id == fx.mentor_id));
}

#[tokio::test]
async fn create_notes_too_long() {
    let fx = Fixture::new("create_notes.wal");
    let notes = "x".repeat(MAX_NOTES_LEN + 1);
    let err = assert_err!(
        fx.engine
            .create_booking(fx.mentee, fx.mentor_id, slot(10, 0), Some(notes))
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn snapshot_survives_profile_change() {
    let fx = Fixture::new("snapshot.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();

    fx.directory
        .upsert_mentor(fx.mentor_id, fx.mentor_account, Decimal::new(900, 0), Some(60), true)
        .unwrap();

    let stored = fx.engine.get_booking(b.id).await.unwrap();
    assert_eq!(stored.price, Decimal::new(500, 0));
    assert_eq!(stored.duration, 45);

    // New bookings see the new profile.
    let later = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    assert_eq!(later.price, Decimal::new(900, 0));
    assert_eq!(later.duration, 60);

    // And settlement charges the snapshotted price.
    let payment = fx.engine.settle_payment(b.id, None).await.unwrap();
    assert_eq!(payment.amount, Decimal::new(500, 0));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_single_winner() {
    const N: usize = 32;
    let fx = Fixture::new("concurrent_create.wal");
    let mentees: Vec<Ulid> = (0..N).map(|_| fx.another_mentee()).collect();

    let mut handles = Vec::new();
    for mentee in mentees {
        let engine = fx.engine.clone();
        let mentor_id = fx.mentor_id;
        handles.push(tokio::spawn(async move {
            engine.create_booking(mentee, mentor_id, slot(10, 30), None).await
        }));
    }

    let mut ok = 0;
    let mut taken = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::SlotTaken { .. }) => taken += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(taken, N - 1);
    assert_eq!(fx.engine.booking_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn held_slots_stay_unique_under_churn() {
    let fx = Fixture::new("churn.wal");
    let mut handles = Vec::new();
    for i in 0..24u32 {
        let engine = fx.engine.clone();
        let mentor_id = fx.mentor_id;
        let mentee = fx.another_mentee();
        handles.push(tokio::spawn(async move {
            let at = slot(10, (i % 4) * 15);
            if let Ok(b) = engine.create_booking(mentee, mentor_id, at, None).await
                && i % 3 == 0
            {
                let _ = engine.cancel_booking(b.id, mentee).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let live: Vec<SlotKey> = fx
        .engine
        .list_bookings_for_mentor(fx.mentor_id)
        .await
        .into_iter()
        .filter(|b| b.status != BookingStatus::Cancelled)
        .map(|b| b.slot)
        .collect();
    let mut deduped = live.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(live.len(), deduped.len());
    assert_eq!(fx.engine.held_slots(fx.mentor_id).await, deduped);
    fx.engine
        .ledger_for(fx.mentor_id)
        .read()
        .await
        .assert_index_matches_rows();

    // A replayed ledger rebuilds the same index.
    let engine = fx.reopen();
    assert_eq!(engine.held_slots(fx.mentor_id).await, deduped);
    engine
        .ledger_for(fx.mentor_id)
        .read()
        .await
        .assert_index_matches_rows();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_settles_single_payment() {
    let fx = Fixture::new("concurrent_settle.wal");
    let id = fx.book(fx.mentee, slot(10, 0)).await.unwrap().id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = fx.engine.clone();
        handles.push(tokio::spawn(async move { engine.settle_payment(id, None).await }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidState, "unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirm_and_cancel_race_consistent() {
    let fx = Fixture::new("confirm_cancel_race.wal");
    let id = fx.book(fx.mentee, slot(10, 0)).await.unwrap().id;

    let e1 = fx.engine.clone();
    let e2 = fx.engine.clone();
    let mentee = fx.mentee;
    let confirm = tokio::spawn(async move { e1.confirm_booking(id).await });
    let cancel = tokio::spawn(async move { e2.cancel_booking(id, mentee).await });
    let confirm = confirm.await.unwrap();
    let cancel = cancel.await.unwrap();

    // Cancel always wins eventually: it is legal from both PENDING and CONFIRMED.
    assert_ok!(cancel);
    match confirm {
        Ok(c) => assert_eq!(c.status, BookingStatus::Confirmed),
        Err(e) => assert!(matches!(e, EngineError::InvalidState { .. })),
    }
    let final_state = fx.engine.get_booking(id).await.unwrap();
    assert_eq!(final_state.status, BookingStatus::Cancelled);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn confirm_is_idempotent() {
    let fx = Fixture::new("confirm_idempotent.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();

    let first = fx.engine.confirm_booking(b.id).await.unwrap();
    let second = assert_ok!(fx.engine.confirm_booking(b.id).await);
    assert_eq!(first, second);
    assert!(first.meeting_reference.is_some());
}

#[tokio::test]
async fn confirm_after_cancel_invalid_state() {
    let fx = Fixture::new("confirm_after_cancel.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    fx.engine.cancel_booking(b.id, fx.mentee).await.unwrap();

    let err = assert_err!(fx.engine.confirm_booking(b.id).await);
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: BookingStatus::Cancelled,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn confirm_unknown_not_found() {
    let fx = Fixture::new("confirm_unknown.wal");
    let err = assert_err!(fx.engine.confirm_booking(Ulid::new()).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn meeting_references_distinct() {
    let fx = Fixture::new("meeting_refs.wal");
    let a = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let b = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    let a = fx.engine.confirm_booking(a.id).await.unwrap();
    let b = fx.engine.confirm_booking(b.id).await.unwrap();
    assert_ne!(a.meeting_reference, b.meeting_reference);
}

#[tokio::test]
async fn cancel_by_mentor_account_allowed() {
    let fx = Fixture::new("cancel_mentor.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let cancelled = assert_ok!(fx.engine.cancel_booking(b.id, fx.mentor_account).await);
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert!(fx.engine.held_slots(fx.mentor_id).await.is_empty());
}

#[tokio::test]
async fn cancel_by_stranger_unauthorized() {
    let fx = Fixture::new("cancel_stranger.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let stranger = fx.another_mentee();

    let err = assert_err!(fx.engine.cancel_booking(b.id, stranger).await);
    assert_eq!(err.kind(), ErrorKind::Authorization);
    // Nothing changed.
    assert_eq!(
        fx.engine.get_booking(b.id).await.unwrap().status,
        BookingStatus::Pending
    );
}

#[tokio::test]
async fn cancel_terminal_invalid_state() {
    let fx = Fixture::new("cancel_terminal.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    fx.engine.cancel_booking(b.id, fx.mentee).await.unwrap();
    let err = assert_err!(fx.engine.cancel_booking(b.id, fx.mentee).await);
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let c = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    fx.engine.settle_payment(c.id, None).await.unwrap();
    let done = assert_ok!(fx.engine.complete_booking(c.id).await);
    assert_eq!(done.status, BookingStatus::Completed);
    let err = assert_err!(fx.engine.cancel_booking(c.id, fx.mentee).await);
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: BookingStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn completed_still_holds_slot() {
    let fx = Fixture::new("completed_holds.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    fx.engine.confirm_booking(b.id).await.unwrap();
    fx.engine.complete_booking(b.id).await.unwrap();

    let other = fx.another_mentee();
    assert!(matches!(
        fx.book(other, slot(10, 0)).await,
        Err(EngineError::SlotTaken { .. })
    ));
}

#[tokio::test]
async fn complete_requires_confirmed() {
    let fx = Fixture::new("complete_pending.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let err = assert_err!(fx.engine.complete_booking(b.id).await);
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: BookingStatus::Pending,
            ..
        }
    ));
}

// ── Settlement ───────────────────────────────────────────

#[tokio::test]
async fn settle_twice_not_payable() {
    let fx = Fixture::new("settle_twice.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let payment = fx.engine.settle_payment(b.id, Some("UPI".into())).await.unwrap();
    assert_eq!(payment.method, "UPI");

    // The booking is CONFIRMED now, so the status check answers first.
    let err = assert_err!(fx.engine.settle_payment(b.id, None).await);
    assert!(matches!(
        err,
        EngineError::InvalidState { id, status: BookingStatus::Confirmed, .. } if id == b.id
    ));
    // Still exactly the first payment.
    assert_eq!(fx.engine.get_payment_for_booking(b.id).await.unwrap(), payment);
}

#[tokio::test]
async fn settle_after_paid_and_cancelled_not_payable() {
    let fx = Fixture::new("settle_paid_cancelled.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let payment = fx.engine.settle_payment(b.id, None).await.unwrap();
    fx.engine.cancel_booking(b.id, fx.mentee).await.unwrap();

    let err = assert_err!(fx.engine.settle_payment(b.id, None).await);
    assert!(matches!(
        err,
        EngineError::InvalidState { status: BookingStatus::Cancelled, .. }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(fx.engine.get_payment_for_booking(b.id).await.unwrap(), payment);
}

#[tokio::test]
async fn settle_pending_with_payment_row_already_paid() {
    let fx = Fixture::new("settle_stray_payment.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    {
        let ledger = fx.engine.ledger_for(fx.mentor_id);
        let mut guard = ledger.write().await;
        guard.record_payment(Payment {
            id: Ulid::new(),
            booking_id: b.id,
            amount: b.price,
            currency: "INR".into(),
            transaction_reference: "DEMO_stray".into(),
            status: PaymentStatus::Success,
            method: "DEMO".into(),
            created_at: 0,
        });
    }

    let err = assert_err!(fx.engine.settle_payment(b.id, None).await);
    assert!(matches!(err, EngineError::AlreadyPaid(id) if id == b.id));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let still = fx.engine.get_booking(b.id).await.unwrap();
    assert_eq!(still.status, BookingStatus::Pending);
}

#[tokio::test]
async fn settle_not_pending_invalid_state() {
    let fx = Fixture::new("settle_not_pending.wal");
    let cancelled = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    fx.engine.cancel_booking(cancelled.id, fx.mentee).await.unwrap();
    let err = assert_err!(fx.engine.settle_payment(cancelled.id, None).await);
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // Confirmed without payment: not payable either.
    let confirmed = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    fx.engine.confirm_booking(confirmed.id).await.unwrap();
    let err = assert_err!(fx.engine.settle_payment(confirmed.id, None).await);
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn settle_validates_method() {
    let fx = Fixture::new("settle_method.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let err = assert_err!(fx.engine.settle_payment(b.id, Some("  ".into())).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = assert_err!(
        fx.engine
            .settle_payment(b.id, Some("x".repeat(MAX_METHOD_LEN + 1)))
            .await
    );
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    // Refused settlements leave the booking payable.
    assert_ok!(fx.engine.settle_payment(b.id, None).await);
}

#[tokio::test]
async fn payment_lookup_before_settle_not_found() {
    let fx = Fixture::new("payment_lookup.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let err = assert_err!(fx.engine.get_payment_for_booking(b.id).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn subscriber_receives_confirmation_notice() {
    let fx = Fixture::new("notice_delivered.wal");
    let mut mentor_rx = fx.hub.subscribe(fx.mentor_account);
    let mut mentee_rx = fx.hub.subscribe(fx.mentee);

    let b = fx
        .engine
        .create_booking(fx.mentee, fx.mentor_id, slot(10, 30), Some("resume review".into()))
        .await
        .unwrap();
    fx.engine.settle_payment(b.id, None).await.unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(2), mentee_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.booking_id, b.id);
    assert_eq!(notice.mentor_contact, "mentor@example.com");
    assert_eq!(notice.mentee_contact, "mentee@example.com");
    assert_eq!(notice.date, monday());
    assert_eq!(notice.time, time(10, 30));
    assert_eq!(notice.duration, 45);
    assert_eq!(notice.price, Decimal::new(500, 0));
    assert_eq!(notice.notes.as_deref(), Some("resume review"));

    let confirmed = fx.engine.get_booking(b.id).await.unwrap();
    assert_eq!(Some(notice.meeting_reference), confirmed.meeting_reference);

    let mentor_notice = tokio::time::timeout(Duration::from_secs(2), mentor_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mentor_notice.booking_id, b.id);
}

#[tokio::test]
async fn failing_sink_does_not_fail_confirm() {
    let fx = Fixture::with_sink("notice_failing.wal", Some(Arc::new(FailingSink)));
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();

    let confirmed = assert_ok!(fx.engine.confirm_booking(b.id).await);
    assert_eq!(confirmed.status, BookingStatus::Confirmed);

    let c = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    assert_ok!(fx.engine.settle_payment(c.id, None).await);

    // Give the spawned deliveries a chance to run and fail.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        fx.engine.get_booking(c.id).await.unwrap().status,
        BookingStatus::Confirmed
    );
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn lists_newest_slot_first() {
    let fx = Fixture::new("list_order.wal");
    let next_monday = SlotKey::new(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(), time(10, 0));

    let early = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let late = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    let next = fx.book(fx.mentee, next_monday).await.unwrap();

    let ids: Vec<Ulid> = fx
        .engine
        .list_bookings_for_mentor(fx.mentor_id)
        .await
        .iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![next.id, late.id, early.id]);

    let ids: Vec<Ulid> = fx
        .engine
        .list_bookings_for_mentee(fx.mentee)
        .await
        .iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![next.id, late.id, early.id]);
}

#[tokio::test]
async fn list_ties_broken_by_booking_id() {
    let fx = Fixture::new("list_ties.wal");
    let first = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    fx.engine.cancel_booking(first.id, fx.mentee).await.unwrap();
    let second = fx.book(fx.mentee, slot(10, 0)).await.unwrap();

    let listed = fx.engine.list_bookings_for_mentor(fx.mentor_id).await;
    assert_eq!(listed.len(), 2);
    let (hi, lo) = if first.id > second.id {
        (first.id, second.id)
    } else {
        (second.id, first.id)
    };
    assert_eq!(listed[0].id, hi);
    assert_eq!(listed[1].id, lo);
    // Same answer every time.
    assert_eq!(listed, fx.engine.list_bookings_for_mentor(fx.mentor_id).await);
}

#[tokio::test]
async fn mentee_list_spans_mentors() {
    let fx = Fixture::new("mentee_span.wal");
    let other_account = register(&fx.directory, Role::Mentor, "second@example.com");
    let other_mentor = Ulid::new();
    fx.directory
        .upsert_mentor(other_mentor, other_account, Decimal::new(300, 0), None, true)
        .unwrap();
    fx.directory
        .replace_availability(
            other_mentor,
            vec![AvailabilityWindow::new(Weekday::Mon, time(9, 0), time(12, 0))],
        )
        .unwrap();

    let a = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let b = fx
        .engine
        .create_booking(fx.mentee, other_mentor, slot(11, 0), None)
        .await
        .unwrap();
    assert_eq!(b.duration, 30);

    let ids: Vec<Ulid> = fx
        .engine
        .list_bookings_for_mentee(fx.mentee)
        .await
        .iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec![b.id, a.id]);
    assert_eq!(fx.engine.list_bookings_for_mentor(other_mentor).await.len(), 1);
    assert!(fx.engine.list_bookings_for_mentor(Ulid::new()).await.is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let fx = Fixture::new("replay.wal");
    let paid = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let payment = fx.engine.settle_payment(paid.id, None).await.unwrap();
    let cancelled = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    fx.engine.cancel_booking(cancelled.id, fx.mentee).await.unwrap();
    let pending = fx.book(fx.mentee, slot(10, 45)).await.unwrap();
    let before = fx.engine.list_bookings_for_mentor(fx.mentor_id).await;

    let engine = fx.reopen();
    assert_eq!(engine.list_bookings_for_mentor(fx.mentor_id).await, before);
    assert_eq!(engine.get_payment_for_booking(paid.id).await.unwrap(), payment);
    assert_eq!(engine.held_slots(fx.mentor_id).await, vec![slot(10, 0), slot(10, 45)]);
    assert_eq!(engine.list_bookings_for_mentee(fx.mentee).await.len(), 3);

    // The conflict index was rebuilt too.
    let other = fx.another_mentee();
    assert!(matches!(
        engine
            .create_booking(other, fx.mentor_id, pending.slot, None)
            .await,
        Err(EngineError::SlotTaken { .. })
    ));
    assert_ok!(
        engine
            .create_booking(other, fx.mentor_id, cancelled.slot, None)
            .await
    );
}

#[tokio::test]
async fn torn_settlement_leaves_booking_payable() {
    let fx = Fixture::new("torn_settle.wal");
    let b = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let len_before_settle = std::fs::metadata(&fx.wal_path).unwrap().len();
    fx.engine.settle_payment(b.id, None).await.unwrap();
    let len_after_settle = std::fs::metadata(&fx.wal_path).unwrap().len();
    assert!(len_after_settle > len_before_settle);

    // Crash mid-write: the settlement record is cut short.
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&fx.wal_path)
        .unwrap();
    file.set_len(len_after_settle - 3).unwrap();
    drop(file);

    let engine = fx.reopen();
    let restored = engine.get_booking(b.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Pending);
    assert!(restored.meeting_reference.is_none());
    assert!(engine.get_payment_for_booking(b.id).await.is_err());

    // Retrying settlement resolves it, durably.
    let payment = assert_ok!(engine.settle_payment(b.id, None).await);
    assert_eq!(payment.booking_id, b.id);
    assert_eq!(
        engine.get_booking(b.id).await.unwrap().status,
        BookingStatus::Confirmed
    );

    let engine = fx.reopen();
    assert_eq!(engine.get_payment_for_booking(b.id).await.unwrap(), payment);
    assert_eq!(
        engine.get_booking(b.id).await.unwrap().status,
        BookingStatus::Confirmed
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let fx = Fixture::new("compact.wal");
    let paid = fx.book(fx.mentee, slot(10, 0)).await.unwrap();
    let payment = fx.engine.settle_payment(paid.id, None).await.unwrap();
    let cancelled = fx.book(fx.mentee, slot(10, 30)).await.unwrap();
    fx.engine.cancel_booking(cancelled.id, fx.mentee).await.unwrap();
    let done = fx.book(fx.mentee, slot(10, 45)).await.unwrap();
    fx.engine.confirm_booking(done.id).await.unwrap();
    fx.engine.complete_booking(done.id).await.unwrap();
    let before = fx.engine.list_bookings_for_mentor(fx.mentor_id).await;

    assert!(fx.engine.wal_appends_since_compact().await > 0);
    assert_ok!(fx.engine.compact_wal().await);
    assert_eq!(fx.engine.wal_appends_since_compact().await, 0);

    // Writes after compaction land in the new file.
    let after = fx.book(fx.mentee, slot(10, 15)).await.unwrap();

    let engine = fx.reopen();
    let mut expected = before;
    expected.push(after);
    expected.sort_by(|a, b| b.slot.cmp(&a.slot).then_with(|| b.id.cmp(&a.id)));
    assert_eq!(engine.list_bookings_for_mentor(fx.mentor_id).await, expected);
    assert_eq!(engine.get_payment_for_booking(paid.id).await.unwrap(), payment);
    assert_eq!(
        engine.held_slots(fx.mentor_id).await,
        vec![slot(10, 0), slot(10, 15), slot(10, 45)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_concurrent_with_writes() {
    let fx = Fixture::new("compact_concurrent.wal");
    let mut handles = Vec::new();
    for i in 0..20u32 {
        let engine = fx.engine.clone();
        let mentor_id = fx.mentor_id;
        let mentee = fx.another_mentee();
        handles.push(tokio::spawn(async move {
            let at = SlotKey::new(
                monday() + chrono::Days::new(7 * u64::from(i)),
                time(10, 0),
            );
            engine.create_booking(mentee, mentor_id, at, None).await
        }));
    }
    let compactor = {
        let engine = fx.engine.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                engine.compact_wal().await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
    compactor.await.unwrap();

    let engine = fx.reopen();
    assert_eq!(engine.booking_count(), 20);
    assert_eq!(engine.held_slots(fx.mentor_id).await.len(), 20);
}

impl Fixture {
    /// Insert `n` rows straight into the ledger, one per future Monday at `at`.
    async fn fill_ledger(&self, n: usize, at: NaiveTime, status: BookingStatus) {
        let ledger = self.engine.ledger_for(self.mentor_id);
        let mut guard = ledger.write().await;
        for i in 0..n {
            let day = monday() + chrono::Days::new(7 * (i as u64 + 1));
            guard.insert(Booking {
                id: Ulid::new(),
                mentor_id: self.mentor_id,
                mentor_account_id: self.mentor_account,
                mentee_id: self.mentee,
                slot: SlotKey::new(day, at),
                duration: 45,
                price: Decimal::new(500, 0),
                status,
                meeting_reference: None,
                notes: None,
                created_at: 0,
                updated_at: 0,
            });
        }
    }
}

#[tokio::test]
async fn cancelled_history_does_not_count_against_limit() {
    let fx = Fixture::new("bookings_limit_history.wal");
    fx.fill_ledger(MAX_LIVE_BOOKINGS_PER_MENTOR, time(10, 0), BookingStatus::Cancelled)
        .await;
    let b = assert_ok!(fx.book(fx.mentee, slot(10, 0)).await);
    assert_eq!(b.status, BookingStatus::Pending);
}

#[tokio::test]
async fn live_bookings_limit_enforced() {
    let fx = Fixture::new("bookings_limit_live.wal");
    fx.fill_ledger(MAX_LIVE_BOOKINGS_PER_MENTOR - 1, time(10, 0), BookingStatus::Pending)
        .await;
    let last = assert_ok!(fx.book(fx.mentee, slot(10, 0)).await);
    let err = assert_err!(fx.book(fx.mentee, slot(10, 30)).await);
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    // Cancelling one live booking makes room again.
    fx.engine.cancel_booking(last.id, fx.mentee).await.unwrap();
    assert_ok!(fx.book(fx.mentee, slot(10, 30)).await);
}
