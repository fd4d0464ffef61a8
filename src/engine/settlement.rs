use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::token;

use super::{now_ms, Engine, EngineError};

pub const DEFAULT_PAYMENT_METHOD: &str = "DEMO";

impl Engine {
    /// Record a successful payment for a PENDING booking and confirm it.
    ///
    /// The payment row and the CONFIRMED transition are one WAL record, so after
    /// a crash either both are visible or neither is and the call can be retried.
    pub async fn settle_payment(
        &self,
        booking_id: Ulid,
        method: Option<String>,
    ) -> Result<Payment, EngineError> {
        let method = method.unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string());
        if method.trim().is_empty() {
            return Err(EngineError::Invalid("payment method must not be empty"));
        }
        if method.len() > MAX_METHOD_LEN {
            return Err(EngineError::LimitExceeded("payment method too long"));
        }

        let _gate = self.wal_gate.read().await;
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status: booking.status,
                action: "pay for",
            });
        }
        if guard.payment_for(&booking_id).is_some() {
            return Err(EngineError::AlreadyPaid(booking_id));
        }

        let payment = Payment {
            id: Ulid::new(),
            booking_id,
            amount: booking.price,
            currency: self.config.currency.clone(),
            transaction_reference: token::transaction_reference(),
            status: PaymentStatus::Success,
            method,
            created_at: now_ms(),
        };
        let confirmed = self
            .confirm_locked(&mut guard, booking_id, Some(payment.clone()))
            .await?;
        drop(guard);

        metrics::counter!(crate::observability::SETTLEMENTS_TOTAL).increment(1);
        info!(
            "booking {booking_id} settled: {} {} via {} ({})",
            payment.amount, payment.currency, payment.method, payment.transaction_reference
        );
        self.dispatch_confirmation(confirmed);
        Ok(payment)
    }

    pub async fn get_payment_for_booking(&self, booking_id: Ulid) -> Result<Payment, EngineError> {
        let mentor_id = self
            .mentor_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ledger = self
            .get_ledger(&mentor_id)
            .ok_or(EngineError::NotFound(mentor_id))?;
        let guard = ledger.read().await;
        guard
            .payment_for(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }
}
