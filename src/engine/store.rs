use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::*;

/// An aggregate plus the commit counter optimistic transactions validate against.
#[derive(Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

pub type Shared<T> = Arc<RwLock<Versioned<T>>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(Versioned { version: 0, value }))
}

/// State that evolves only by applying committed events.
/// Must be deterministic: WAL replay goes through the same code.
pub trait Aggregate {
    fn apply(&mut self, event: &Event);
}

impl Aggregate for TutorCalendar {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::TutorRegistered { tutor } => {
                self.tutor = tutor.clone();
            }
            Event::BookingCreated { booking } => {
                self.reindex(
                    booking.id,
                    booking.span,
                    RecordKind::Booking,
                    booking.status.is_occupying(),
                );
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingRescheduled { id, span, change, .. } => {
                let Some(booking) = self.bookings.get_mut(id) else { return };
                booking.span = *span;
                booking.record_status(change.clone());
                let occupying = booking.status.is_occupying();
                self.reindex(*id, *span, RecordKind::Booking, occupying);
            }
            Event::BookingStatusChanged { id, change, payment_id, .. } => {
                let Some(booking) = self.bookings.get_mut(id) else { return };
                booking.record_status(change.clone());
                if let Some(pid) = payment_id {
                    booking.payment_ids.insert(pid.clone());
                }
                let (span, occupying) = (booking.span, booking.status.is_occupying());
                self.reindex(*id, span, RecordKind::Booking, occupying);
            }
            Event::GroupSessionCreated { session } => {
                self.reindex(
                    session.id,
                    session.span,
                    RecordKind::GroupSession,
                    session.status.is_occupying(),
                );
                self.sessions.insert(session.id, session.clone());
            }
            Event::GroupSessionRescheduled { id, span, .. } => {
                let Some(session) = self.sessions.get_mut(id) else { return };
                session.span = *span;
                let occupying = session.status.is_occupying();
                self.reindex(*id, *span, RecordKind::GroupSession, occupying);
            }
            Event::GroupSessionStatusChanged { id, status, .. } => {
                let Some(session) = self.sessions.get_mut(id) else { return };
                session.status = *status;
                let span = session.span;
                self.reindex(*id, span, RecordKind::GroupSession, status.is_occupying());
            }
            Event::ParticipantRegistered { session_id, user_id, .. } => {
                if let Some(session) = self.sessions.get_mut(session_id)
                    && !session.has_participant(user_id)
                {
                    session.participants.push(user_id.clone());
                }
            }
            Event::ParticipantUnregistered { session_id, user_id, .. } => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.participants.retain(|p| p != user_id);
                }
            }
            Event::TimeOffCreated { time_off } => {
                self.reindex(time_off.id, time_off.span, RecordKind::TimeOff, true);
                self.time_off.insert(time_off.id, time_off.clone());
            }
            Event::TimeOffRemoved { id, .. } => {
                self.time_off.remove(id);
                self.remove_interval(*id);
            }
            // Ledger events live on accounts.
            Event::CreditsGranted { .. } | Event::AccountRestored { .. } => {}
        }
    }
}

impl Aggregate for Account {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::CreditsGranted {
                credit_type,
                amount,
                dedupe_key,
                ..
            } => {
                let balance = self.credits.entry(credit_type.clone()).or_insert(0);
                *balance = balance.saturating_add(*amount);
                self.processed_payments.insert(dedupe_key.clone());
            }
            Event::AccountRestored { account } => {
                *self = account.clone();
            }
            _ => {}
        }
    }
}

/// Events that recreate a calendar's current state from nothing.
pub fn snapshot_calendar(cal: &TutorCalendar) -> Vec<Event> {
    let mut events = Vec::with_capacity(1 + cal.record_count());
    events.push(Event::TutorRegistered { tutor: cal.tutor.clone() });

    let mut bookings: Vec<&Booking> = cal.bookings.values().collect();
    bookings.sort_by_key(|b| b.id);
    events.extend(bookings.into_iter().map(|b| Event::BookingCreated { booking: b.clone() }));

    let mut sessions: Vec<&GroupSession> = cal.sessions.values().collect();
    sessions.sort_by_key(|s| s.id);
    events.extend(
        sessions
            .into_iter()
            .map(|s| Event::GroupSessionCreated { session: s.clone() }),
    );

    let mut time_off: Vec<&TimeOff> = cal.time_off.values().collect();
    time_off.sort_by_key(|t| t.id);
    events.extend(
        time_off
            .into_iter()
            .map(|t| Event::TimeOffCreated { time_off: t.clone() }),
    );
    events
}
