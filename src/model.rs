use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for audit timestamps only; slots are calendar values.
pub type Ms = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Mentor,
    Mentee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub role: Role,
    /// Where confirmation notices for this account go (an email address in practice).
    pub contact: String,
}

/// Mentor profile as the engine sees it: pricing and ownership, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentorSnapshot {
    pub mentor_id: Ulid,
    pub account_id: Ulid,
    pub session_price: Decimal,
    /// Minutes.
    pub session_duration: u32,
    pub active: bool,
}

/// A recurring weekly window, `[start, end)` on `day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl AvailabilityWindow {
    pub fn new(day: Weekday, start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "window start must be before end");
        Self { day, start, end }
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    /// True if a session starting at `slot` falls inside this window.
    pub fn offers(&self, slot: &SlotKey) -> bool {
        slot.date.weekday() == self.day && self.start <= slot.time && slot.time < self.end
    }
}

/// One candidate session start for a mentor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl SlotKey {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self { date, time }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.date, self.time.format("%H:%M"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// Whether a booking in this status holds its slot.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub mentor_id: Ulid,
    /// Owner of the mentor profile at creation time; may cancel.
    pub mentor_account_id: Ulid,
    pub mentee_id: Ulid,
    pub slot: SlotKey,
    /// Minutes, snapshotted from the mentor profile.
    pub duration: u32,
    /// Snapshotted from the mentor profile.
    pub price: Decimal,
    pub status: BookingStatus,
    pub meeting_reference: Option<String>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_reference: String,
    pub status: PaymentStatus,
    pub method: String,
    pub created_at: Ms,
}

/// Payload handed to the notification sink when a booking is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationNotice {
    pub booking_id: Ulid,
    pub mentor_contact: String,
    pub mentee_contact: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub duration: u32,
    pub price: Decimal,
    pub meeting_reference: String,
    pub notes: Option<String>,
}

/// The event types. This is the WAL record format; every variant names its mentor
/// so replay can route it to the right ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingConfirmed {
        id: Ulid,
        mentor_id: Ulid,
        meeting_reference: String,
        at: Ms,
    },
    /// Payment row and the PENDING -> CONFIRMED transition in one record.
    PaymentSettled {
        mentor_id: Ulid,
        payment: Payment,
        meeting_reference: String,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        mentor_id: Ulid,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        mentor_id: Ulid,
        at: Ms,
    },
    /// Written by compaction only: restores a payment without touching its booking.
    PaymentRecorded {
        mentor_id: Ulid,
        payment: Payment,
    },
}

impl Event {
    pub fn mentor_id(&self) -> Ulid {
        match self {
            Event::BookingCreated { booking } => booking.mentor_id,
            Event::BookingConfirmed { mentor_id, .. }
            | Event::PaymentSettled { mentor_id, .. }
            | Event::BookingCancelled { mentor_id, .. }
            | Event::BookingCompleted { mentor_id, .. }
            | Event::PaymentRecorded { mentor_id, .. } => *mentor_id,
        }
    }
}
