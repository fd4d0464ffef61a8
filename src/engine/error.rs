use ulid::Ulid;

use crate::model::{BookingStatus, SlotKey};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    Unauthorized(&'static str),
    SlotTaken {
        mentor_id: Ulid,
        slot: SlotKey,
    },
    AlreadyPaid(Ulid),
    AlreadyExists {
        what: &'static str,
        id: Ulid,
    },
    InvalidState {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    SlotNotOffered {
        mentor_id: Ulid,
        slot: SlotKey,
    },
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
    Collaborator(String),
}

/// Coarse classification reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Authorization,
    Conflict,
    InvalidState,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Unauthorized(_) => ErrorKind::Authorization,
            EngineError::SlotTaken { .. }
            | EngineError::AlreadyPaid(_)
            | EngineError::AlreadyExists { .. } => ErrorKind::Conflict,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::SlotNotOffered { .. }
            | EngineError::Invalid(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::WalError(_) | EngineError::Collaborator(_) => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Unauthorized(msg) => write!(f, "not authorized: {msg}"),
            EngineError::SlotTaken { mentor_id, slot } => {
                write!(f, "slot already booked: mentor {mentor_id} at {slot}")
            }
            EngineError::AlreadyPaid(id) => write!(f, "already paid: booking {id}"),
            EngineError::AlreadyExists { what, id } => write!(f, "{what} {id} already exists"),
            EngineError::InvalidState { id, status, action } => {
                write!(f, "cannot {action} booking {id} in status {status}")
            }
            EngineError::SlotNotOffered { mentor_id, slot } => {
                write!(f, "slot not offered: mentor {mentor_id} has no window covering {slot}")
            }
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Collaborator(e) => write!(f, "collaborator error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
