use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_text, check_user_id};
use super::{Engine, EngineError, Txn};

fn payment_label(outcome: &Result<PaymentOutcome, EngineError>) -> &'static str {
    match outcome {
        Ok(PaymentOutcome::Applied) => "applied",
        Ok(PaymentOutcome::Duplicate) => "duplicate",
        Err(e) => e.code(),
    }
}

impl Engine {
    /// Apply a completed payment exactly once per `payment_id`.
    ///
    /// The dedupe key is checked and recorded in the same transaction as the
    /// effect, so a replayed notice is a no-op.
    pub async fn apply_payment(
        &self,
        caller: &Caller,
        notice: PaymentNotice,
    ) -> Result<PaymentOutcome, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Unauthorized("only the payment service applies payments"));
        }
        if notice.payment_id.is_empty() {
            return Err(EngineError::InvalidInterval("payment id must not be empty"));
        }
        check_text(&notice.payment_id, MAX_PAYMENT_ID_LEN, "payment id too long")?;
        check_user_id(&notice.user_id)?;

        let product = match &notice.product {
            PaymentProduct::Package { .. } => "package",
            PaymentProduct::Booking { .. } => "booking",
        };
        let result = match &notice.product {
            PaymentProduct::Package {
                credit_type,
                lessons,
            } => {
                check_text(credit_type, MAX_NAME_LEN, "credit type too long")?;
                if *lessons == 0 {
                    return Err(EngineError::InvalidInterval("package must contain lessons"));
                }
                if *lessons > MAX_CREDITS_PER_PAYMENT {
                    return Err(EngineError::LimitExceeded("too many credits in one payment"));
                }
                self.grant_credits(
                    &notice.user_id,
                    credit_type,
                    *lessons,
                    notice.payment_id.clone(),
                )
                .await
            }
            PaymentProduct::Booking { booking_id } => self.confirm_paid_booking(&notice, *booking_id).await,
        };

        metrics::counter!(
            observability::PAYMENTS_TOTAL,
            "product" => product,
            "outcome" => payment_label(&result)
        )
        .increment(1);
        match &result {
            Ok(PaymentOutcome::Applied) => {
                info!("payment {} applied for {}", notice.payment_id, notice.user_id)
            }
            Ok(PaymentOutcome::Duplicate) => {
                debug!("payment {} already applied, ignoring", notice.payment_id)
            }
            Err(e) => debug!("payment {} rejected: {e}", notice.payment_id),
        }
        result
    }

    async fn confirm_paid_booking(
        &self,
        notice: &PaymentNotice,
        booking_id: ulid::Ulid,
    ) -> Result<PaymentOutcome, EngineError> {
        let cell = self.calendar_for_record(&booking_id)?;
        let payment_id = &notice.payment_id;

        self.transact(&cell, "apply_payment", |cal, now| {
            let b = cal
                .bookings
                .get(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            if b.payment_ids.contains(payment_id) {
                return Ok(Txn::Read(PaymentOutcome::Duplicate));
            }
            if b.user_id != notice.user_id {
                return Err(EngineError::Unauthorized("payment user does not own booking"));
            }
            if !matches!(
                b.status,
                BookingStatus::AwaitingPayment | BookingStatus::PaymentPendingConfirmation
            ) {
                return Err(EngineError::transition(b.status, BookingStatus::Confirmed));
            }
            let event = Event::BookingStatusChanged {
                id: booking_id,
                tutor_id: b.tutor_id,
                change: StatusChange {
                    status: BookingStatus::Confirmed,
                    at: now,
                    actor: "payment".into(),
                    reason: Some(format!("payment {payment_id}")),
                },
                payment_id: Some(payment_id.clone()),
            };
            Ok(Txn::Write(event, PaymentOutcome::Applied))
        })
        .await
    }

    /// Add credits to a user's account unless `dedupe_key` was seen before.
    pub(super) async fn grant_credits(
        &self,
        user_id: &str,
        credit_type: &str,
        amount: u32,
        dedupe_key: String,
    ) -> Result<PaymentOutcome, EngineError> {
        let cell = self.account_cell(user_id);
        self.transact(&cell, "grant_credits", |acct, _now| {
            if acct.processed_payments.contains(&dedupe_key) {
                return Ok(Txn::Read(PaymentOutcome::Duplicate));
            }
            let event = Event::CreditsGranted {
                user_id: user_id.to_string(),
                credit_type: credit_type.to_string(),
                amount,
                dedupe_key: dedupe_key.clone(),
            };
            Ok(Txn::Write(event, PaymentOutcome::Applied))
        })
        .await
    }

    /// Credit balance per credit type. Unknown users have none.
    pub async fn credits(
        &self,
        caller: &Caller,
        user_id: &str,
    ) -> Result<BTreeMap<String, u32>, EngineError> {
        if !caller.can_act_for(user_id) {
            return Err(EngineError::Unauthorized("cannot read another user's credits"));
        }
        let Some(cell) = self.accounts.get(user_id).map(|e| e.value().clone()) else {
            return Ok(BTreeMap::new());
        };
        let guard = cell.read().await;
        Ok(guard.value.credits.clone())
    }
}
