//! Opaque references handed out on confirmation and settlement.
//!
//! Each token embeds a fresh ULID: a millisecond timestamp plus 80 random bits.
//! Two tokens collide only if they are minted in the same millisecond with the
//! same 80-bit draw, which is negligible at any realistic booking rate. No
//! shared counter is involved.

use ulid::Ulid;

/// Meeting link for a confirmed booking: `prefix` followed by a lowercase token.
pub fn meeting_reference(prefix: &str) -> String {
    format!("{prefix}{}", Ulid::new().to_string().to_lowercase())
}

/// Reference recorded on a settled payment.
pub fn transaction_reference() -> String {
    format!("DEMO_{}", Ulid::new())
}
