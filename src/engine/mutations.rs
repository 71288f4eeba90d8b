use std::collections::BTreeSet;

use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{
    check_no_conflict, check_not_past, check_notice, check_text, check_user_id, validate_span,
};
use super::store::{Shared, shared};
use super::{Engine, EngineError, Txn};

/// Everything `reserve` needs besides the caller.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub tutor_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub payload: ReservationPayload,
}

fn record_outcome<T>(op: &'static str, kind: RecordKind, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::counter!(
        observability::RESERVATIONS_TOTAL,
        "op" => op,
        "kind" => kind.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

fn history_entry(status: BookingStatus, now: Ms, caller: &Caller, reason: Option<String>) -> StatusChange {
    StatusChange {
        status,
        at: now,
        actor: caller.user_id.clone(),
        reason,
    }
}

/// Pending hold on a record id; released on drop unless the record committed.
struct IdClaim<'a> {
    engine: &'a Engine,
    id: Ulid,
    tutor_id: Ulid,
    kept: bool,
}

impl IdClaim<'_> {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            let tutor_id = self.tutor_id;
            self.engine
                .record_to_tutor
                .remove_if(&self.id, |_, claimed| *claimed == tutor_id);
        }
    }
}

impl Engine {
    pub async fn register_tutor(&self, caller: &Caller, tutor: Tutor) -> Result<(), EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Unauthorized("only admins register tutors"));
        }
        check_text(&tutor.name, MAX_NAME_LEN, "tutor name too long")?;
        if tutor.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(EngineError::InvalidInterval("utc offset out of range"));
        }

        let _registering = self.registration.lock().await;
        if self.tutors.len() >= MAX_TUTORS {
            return Err(EngineError::LimitExceeded("too many tutors"));
        }
        if self.tutors.contains_key(&tutor.id) {
            return Err(EngineError::AlreadyExists(tutor.id));
        }

        let id = tutor.id;
        let event = Event::TutorRegistered { tutor: tutor.clone() };
        self.persist_then(&event, || {
            self.tutors
                .entry(id)
                .or_insert_with(|| shared(TutorCalendar::new(tutor)));
        })
        .await?;
        info!("tutor {id} registered");
        Ok(())
    }

    /// Create a booking, group session or time-off if its span is free.
    pub async fn reserve(&self, caller: &Caller, req: ReserveRequest) -> Result<Ulid, EngineError> {
        let kind = req.payload.kind();
        let result = self.reserve_inner(caller, req).await;
        record_outcome("reserve", kind, &result);
        match &result {
            Ok(id) => debug!("reserve {} {id} by {}", kind.as_str(), caller.user_id),
            Err(e) => debug!("reserve {} rejected for {}: {e}", kind.as_str(), caller.user_id),
        }
        result
    }

    async fn reserve_inner(&self, caller: &Caller, req: ReserveRequest) -> Result<Ulid, EngineError> {
        let span = validate_span(req.start, req.end)?;

        let owner = match &req.payload {
            ReservationPayload::Booking {
                user_id,
                lesson_type,
                ..
            } => {
                let owner = user_id.clone().unwrap_or_else(|| caller.user_id.clone());
                check_user_id(&owner)?;
                check_text(lesson_type, MAX_NAME_LEN, "lesson type too long")?;
                if !caller.can_act_for(&owner) {
                    return Err(EngineError::Unauthorized("cannot book for another user"));
                }
                owner
            }
            ReservationPayload::GroupSession {
                title,
                max_students,
            } => {
                if !caller.is_admin() {
                    return Err(EngineError::Unauthorized("only admins schedule group sessions"));
                }
                check_text(title, MAX_NAME_LEN, "session title too long")?;
                if *max_students == 0 {
                    return Err(EngineError::InvalidInterval("max_students must be positive"));
                }
                if *max_students > MAX_GROUP_SIZE {
                    return Err(EngineError::LimitExceeded("group too large"));
                }
                caller.user_id.clone()
            }
            ReservationPayload::TimeOff { reason } => {
                if !caller.is_admin() {
                    return Err(EngineError::Unauthorized("only admins add time off"));
                }
                check_text(reason, MAX_TEXT_LEN, "reason too long")?;
                caller.user_id.clone()
            }
        };

        let id = req.id.unwrap_or_else(Ulid::new);
        let tutor_id = req.tutor_id;
        let cell = self.calendar(&tutor_id)?;

        let claim = self.claim_record_id(id, tutor_id)?;
        let result = self
            .commit_reservation(&cell, caller, id, span, owner, req)
            .await;
        if result.is_ok() {
            claim.keep();
        }
        result
    }

    /// Reserve `id` across every tutor until the guard is kept or dropped.
    fn claim_record_id(&self, id: Ulid, tutor_id: Ulid) -> Result<IdClaim<'_>, EngineError> {
        match self.record_to_tutor.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(tutor_id);
                Ok(IdClaim {
                    engine: self,
                    id,
                    tutor_id,
                    kept: false,
                })
            }
        }
    }

    async fn commit_reservation(
        &self,
        cell: &Shared<TutorCalendar>,
        caller: &Caller,
        id: Ulid,
        span: Span,
        owner: UserId,
        req: ReserveRequest,
    ) -> Result<Ulid, EngineError> {
        let tutor_id = req.tutor_id;
        let kind = req.payload.kind();
        self.transact(cell, "reserve", |cal, now| {
            if cal.contains_record(&id) {
                return Err(EngineError::AlreadyExists(id));
            }
            if cal.record_count() >= MAX_RECORDS_PER_TUTOR {
                return Err(EngineError::LimitExceeded("too many records on tutor"));
            }
            if kind != RecordKind::TimeOff {
                check_not_past(&span, now)?;
            }
            check_no_conflict(cal, &span, None)?;

            let event = match &req.payload {
                ReservationPayload::Booking {
                    lesson_type,
                    price_cents,
                    ..
                } => {
                    // Free lessons skip the payment step.
                    let status = if *price_cents == 0 {
                        BookingStatus::Confirmed
                    } else {
                        BookingStatus::AwaitingPayment
                    };
                    Event::BookingCreated {
                        booking: Booking {
                            id,
                            tutor_id,
                            user_id: owner.clone(),
                            lesson_type: lesson_type.clone(),
                            price_cents: *price_cents,
                            span,
                            status,
                            status_history: vec![history_entry(status, now, caller, None)],
                            payment_ids: BTreeSet::new(),
                        },
                    }
                }
                ReservationPayload::GroupSession {
                    title,
                    max_students,
                } => Event::GroupSessionCreated {
                    session: GroupSession {
                        id,
                        tutor_id,
                        title: title.clone(),
                        span,
                        max_students: *max_students,
                        participants: Vec::new(),
                        status: SessionStatus::Scheduled,
                    },
                },
                ReservationPayload::TimeOff { reason } => Event::TimeOffCreated {
                    time_off: TimeOff {
                        id,
                        tutor_id,
                        span,
                        reason: reason.clone(),
                        created_by: owner.clone(),
                    },
                },
            };
            Ok(Txn::Write(event, id))
        })
        .await
    }

    /// Move a booking or group session, keeping its status.
    pub async fn reschedule(
        &self,
        caller: &Caller,
        id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Record, EngineError> {
        let span = validate_span(start, end)?;
        let cell = self.calendar_for_record(&id)?;
        let lesson_notice = self.settings.lesson_notice_ms;
        let session_notice = self.settings.session_notice_ms;

        let result = self
            .transact(&cell, "reschedule", |cal, now| {
                if let Some(b) = cal.bookings.get(&id) {
                    if !caller.can_act_for(&b.user_id) {
                        return Err(EngineError::Unauthorized("not your booking"));
                    }
                    if !b.status.is_reschedulable() {
                        return Err(EngineError::NotReschedulable(id));
                    }
                    check_notice(b.span.start, now, lesson_notice, RecordKind::Booking)?;
                    check_not_past(&span, now)?;
                    check_no_conflict(cal, &span, Some(id))?;

                    let change = history_entry(
                        b.status,
                        now,
                        caller,
                        Some(format!("rescheduled from {}", b.span)),
                    );
                    let mut moved = b.clone();
                    moved.span = span;
                    moved.record_status(change.clone());
                    let event = Event::BookingRescheduled {
                        id,
                        tutor_id: b.tutor_id,
                        span,
                        change,
                    };
                    return Ok(Txn::Write(event, Record::Booking(moved)));
                }
                if let Some(s) = cal.sessions.get(&id) {
                    if !caller.is_admin() {
                        return Err(EngineError::Unauthorized("only admins move group sessions"));
                    }
                    if s.status != SessionStatus::Scheduled {
                        return Err(EngineError::NotReschedulable(id));
                    }
                    check_notice(s.span.start, now, session_notice, RecordKind::GroupSession)?;
                    check_not_past(&span, now)?;
                    check_no_conflict(cal, &span, Some(id))?;

                    let mut moved = s.clone();
                    moved.span = span;
                    let event = Event::GroupSessionRescheduled {
                        id,
                        tutor_id: s.tutor_id,
                        span,
                    };
                    return Ok(Txn::Write(event, Record::GroupSession(moved)));
                }
                if cal.time_off.contains_key(&id) {
                    if !caller.is_admin() {
                        return Err(EngineError::Unauthorized("only admins manage time off"));
                    }
                    return Err(EngineError::NotReschedulable(id));
                }
                Err(EngineError::NotFound(id))
            })
            .await;

        let kind = match &result {
            Ok(record) => record.kind(),
            Err(EngineError::RescheduleWindowClosed { kind, .. }) => *kind,
            Err(_) => RecordKind::Booking,
        };
        record_outcome("reschedule", kind, &result);
        if let Ok(record) = &result {
            debug!("rescheduled {id} to {} by {}", record.span(), caller.user_id);
        }
        result
    }

    /// Cancel a booking or group session, or delete time-off.
    pub async fn cancel(
        &self,
        caller: &Caller,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        if let Some(r) = &reason {
            check_text(r, MAX_TEXT_LEN, "reason too long")?;
        }
        let cell = self.calendar_for_record(&id)?;

        let result = self
            .transact(&cell, "cancel", |cal, now| {
                if let Some(b) = cal.bookings.get(&id) {
                    if !caller.can_act_for(&b.user_id) {
                        return Err(EngineError::Unauthorized("not your booking"));
                    }
                    if !b.status.is_occupying() {
                        return Err(EngineError::NotCancellable(id));
                    }
                    let (next, outcome) = if caller.is_admin()
                        || b.status == BookingStatus::AwaitingPayment
                    {
                        (BookingStatus::Cancelled, CancelOutcome::Cancelled)
                    } else if b.status == BookingStatus::CancellationRequested {
                        return Err(EngineError::NotCancellable(id));
                    } else {
                        (
                            BookingStatus::CancellationRequested,
                            CancelOutcome::CancellationRequested,
                        )
                    };
                    let event = Event::BookingStatusChanged {
                        id,
                        tutor_id: b.tutor_id,
                        change: history_entry(next, now, caller, reason.clone()),
                        payment_id: None,
                    };
                    return Ok(Txn::Write(event, outcome));
                }
                if let Some(s) = cal.sessions.get(&id) {
                    if !caller.is_admin() {
                        return Err(EngineError::Unauthorized("only admins cancel group sessions"));
                    }
                    if s.status != SessionStatus::Scheduled {
                        return Err(EngineError::NotCancellable(id));
                    }
                    let event = Event::GroupSessionStatusChanged {
                        id,
                        tutor_id: s.tutor_id,
                        status: SessionStatus::Cancelled,
                    };
                    return Ok(Txn::Write(event, CancelOutcome::Cancelled));
                }
                if let Some(t) = cal.time_off.get(&id) {
                    if !caller.is_admin() {
                        return Err(EngineError::Unauthorized("only admins manage time off"));
                    }
                    let event = Event::TimeOffRemoved {
                        id,
                        tutor_id: t.tutor_id,
                    };
                    return Ok(Txn::Write(event, CancelOutcome::Removed));
                }
                Err(EngineError::NotFound(id))
            })
            .await;

        if let Ok(outcome) = &result {
            info!("cancel {id} by {}: {outcome:?}", caller.user_id);
        }
        result
    }

    /// Settle a pending cancellation request (admin).
    pub async fn resolve_cancellation(
        &self,
        caller: &Caller,
        id: Ulid,
        outcome: BookingStatus,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Unauthorized("only admins resolve cancellations"));
        }
        if !matches!(
            outcome,
            BookingStatus::Cancelled | BookingStatus::Refunded | BookingStatus::CreditIssued
        ) {
            return Err(EngineError::transition(
                BookingStatus::CancellationRequested,
                outcome,
            ));
        }
        if let Some(r) = &reason {
            check_text(r, MAX_TEXT_LEN, "reason too long")?;
        }
        let cell = self.calendar_for_record(&id)?;

        let booking = self
            .transact(&cell, "resolve_cancellation", |cal, now| {
                let b = cal.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
                // A credit grant interrupted after the status commit is
                // finished by resolving again; the ledger dedupes it.
                if b.status == BookingStatus::CreditIssued && outcome == BookingStatus::CreditIssued {
                    return Ok(Txn::Read(b.clone()));
                }
                if b.status != BookingStatus::CancellationRequested {
                    return Err(EngineError::transition(b.status, outcome));
                }
                let change = history_entry(outcome, now, caller, reason.clone());
                let mut resolved = b.clone();
                resolved.record_status(change.clone());
                let event = Event::BookingStatusChanged {
                    id,
                    tutor_id: b.tutor_id,
                    change,
                    payment_id: None,
                };
                Ok(Txn::Write(event, resolved))
            })
            .await?;

        if outcome == BookingStatus::CreditIssued {
            self.grant_credits(
                &booking.user_id,
                &booking.lesson_type,
                1,
                format!("cancellation:{id}"),
            )
            .await?;
        }
        info!("cancellation {id} resolved as {outcome} by {}", caller.user_id);
        Ok(booking)
    }

    /// The user says they paid; wait for the provider to confirm.
    pub async fn mark_payment_pending(&self, caller: &Caller, id: Ulid) -> Result<Booking, EngineError> {
        let cell = self.calendar_for_record(&id)?;
        self.transact(&cell, "mark_payment_pending", |cal, now| {
            let b = cal.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
            if !caller.can_act_for(&b.user_id) {
                return Err(EngineError::Unauthorized("not your booking"));
            }
            let next = BookingStatus::PaymentPendingConfirmation;
            if b.status != BookingStatus::AwaitingPayment {
                return Err(EngineError::transition(b.status, next));
            }
            let change = history_entry(next, now, caller, None);
            let mut updated = b.clone();
            updated.record_status(change.clone());
            let event = Event::BookingStatusChanged {
                id,
                tutor_id: b.tutor_id,
                change,
                payment_id: None,
            };
            Ok(Txn::Write(event, updated))
        })
        .await
    }

    pub async fn register_participant(
        &self,
        caller: &Caller,
        session_id: Ulid,
        user_id: Option<UserId>,
    ) -> Result<GroupSession, EngineError> {
        let user = user_id.unwrap_or_else(|| caller.user_id.clone());
        check_user_id(&user)?;
        if !caller.can_act_for(&user) {
            return Err(EngineError::Unauthorized("cannot register another user"));
        }
        let cell = self.calendar_for_record(&session_id)?;

        let result = self
            .transact(&cell, "register_participant", |cal, now| {
                let s = cal
                    .sessions
                    .get(&session_id)
                    .ok_or(EngineError::NotFound(session_id))?;
                if s.status != SessionStatus::Scheduled || s.span.start <= now {
                    return Err(EngineError::SessionClosed(session_id));
                }
                if s.has_participant(&user) {
                    return Err(EngineError::AlreadyRegistered(session_id));
                }
                if s.is_full() {
                    return Err(EngineError::SessionFull {
                        max_students: s.max_students,
                    });
                }
                let mut updated = s.clone();
                updated.participants.push(user.clone());
                let event = Event::ParticipantRegistered {
                    session_id,
                    tutor_id: s.tutor_id,
                    user_id: user.clone(),
                };
                Ok(Txn::Write(event, updated))
            })
            .await;
        record_outcome("register_participant", RecordKind::GroupSession, &result);
        result
    }

    pub async fn unregister_participant(
        &self,
        caller: &Caller,
        session_id: Ulid,
        user_id: Option<UserId>,
    ) -> Result<GroupSession, EngineError> {
        let user = user_id.unwrap_or_else(|| caller.user_id.clone());
        if !caller.can_act_for(&user) {
            return Err(EngineError::Unauthorized("cannot unregister another user"));
        }
        let cell = self.calendar_for_record(&session_id)?;

        self.transact(&cell, "unregister_participant", |cal, _now| {
            let s = cal
                .sessions
                .get(&session_id)
                .ok_or(EngineError::NotFound(session_id))?;
            if !s.has_participant(&user) {
                return Err(EngineError::NotRegistered(session_id));
            }
            if s.status != SessionStatus::Scheduled {
                return Err(EngineError::SessionClosed(session_id));
            }
            let mut updated = s.clone();
            updated.participants.retain(|p| p != &user);
            let event = Event::ParticipantUnregistered {
                session_id,
                tutor_id: s.tutor_id,
                user_id: user.clone(),
            };
            Ok(Txn::Write(event, updated))
        })
        .await
    }

    pub async fn complete_session(
        &self,
        caller: &Caller,
        session_id: Ulid,
    ) -> Result<GroupSession, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Unauthorized("only admins complete group sessions"));
        }
        let cell = self.calendar_for_record(&session_id)?;

        self.transact(&cell, "complete_session", |cal, _now| {
            let s = cal
                .sessions
                .get(&session_id)
                .ok_or(EngineError::NotFound(session_id))?;
            if s.status != SessionStatus::Scheduled {
                return Err(EngineError::InvalidTransition {
                    from: s.status.to_string(),
                    to: SessionStatus::Completed.to_string(),
                });
            }
            let mut updated = s.clone();
            updated.status = SessionStatus::Completed;
            let event = Event::GroupSessionStatusChanged {
                id: session_id,
                tutor_id: s.tutor_id,
                status: SessionStatus::Completed,
            };
            Ok(Txn::Write(event, updated))
        })
        .await
    }
}
