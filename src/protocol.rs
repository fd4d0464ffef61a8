use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// One request line. Money travels as a decimal string (`"499.00"`), dates as
/// `YYYY-MM-DD`, times as `HH:MM:SS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    RegisterAccount {
        id: Ulid,
        role: Role,
        contact: String,
    },
    UpsertMentor {
        mentor_id: Ulid,
        account_id: Ulid,
        session_price: Decimal,
        #[serde(default)]
        session_duration: Option<u32>,
        #[serde(default = "default_active")]
        active: bool,
    },
    ReplaceAvailability {
        mentor_id: Ulid,
        windows: Vec<AvailabilityWindow>,
    },
    Availability {
        mentor_id: Ulid,
    },
    CreateBooking {
        mentee_id: Ulid,
        mentor_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
        #[serde(default)]
        notes: Option<String>,
    },
    ConfirmBooking {
        booking_id: Ulid,
    },
    CancelBooking {
        booking_id: Ulid,
        actor_id: Ulid,
    },
    CompleteBooking {
        booking_id: Ulid,
    },
    GetBooking {
        booking_id: Ulid,
    },
    ListMentorBookings {
        mentor_id: Ulid,
    },
    ListMenteeBookings {
        mentee_id: Ulid,
    },
    SettlePayment {
        booking_id: Ulid,
        #[serde(default)]
        method: Option<String>,
    },
    GetPayment {
        booking_id: Ulid,
    },
    /// Push this account's confirmation notices down the connection.
    Subscribe {
        account_id: Ulid,
    },
}

fn default_active() -> bool {
    true
}

pub fn parse_command(line: &str) -> Result<Command, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// One response line: `{"ok": ...}`, `{"error": {...}}`, or an unsolicited
/// `{"notice": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(serde_json::Value),
    Error(ErrorBody),
    Notice(ConfirmationNotice),
}

impl Reply {
    pub fn malformed(e: &serde_json::Error) -> Self {
        Reply::Error(ErrorBody {
            kind: "validation".into(),
            message: format!("malformed request: {e}"),
        })
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"error":{{"kind":"internal","message":"encode failed: {e}"}}}}"#)
        })
    }
}

impl From<&EngineError> for Reply {
    fn from(e: &EngineError) -> Self {
        Reply::Error(ErrorBody {
            kind: e.kind().as_str().into(),
            message: e.to_string(),
        })
    }
}
