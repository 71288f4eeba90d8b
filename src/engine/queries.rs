use ulid::Ulid;

use crate::model::*;

use super::store::Shared;
use super::{Engine, EngineError};

impl Engine {
    fn all_calendars(&self) -> Vec<Shared<TutorCalendar>> {
        self.tutors.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn list_tutors(&self) -> Vec<Tutor> {
        let mut tutors = Vec::with_capacity(self.tutors.len());
        for cell in self.all_calendars() {
            tutors.push(cell.read().await.value.tutor.clone());
        }
        tutors.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        tutors
    }

    pub async fn get_tutor(&self, tutor_id: Ulid) -> Result<Tutor, EngineError> {
        let cell = self.calendar(&tutor_id)?;
        let guard = cell.read().await;
        Ok(guard.value.tutor.clone())
    }

    /// A booking is visible to its owner and to admins.
    pub async fn get_booking(&self, caller: &Caller, id: Ulid) -> Result<Booking, EngineError> {
        let cell = self.calendar_for_record(&id)?;
        let guard = cell.read().await;
        let booking = guard.value.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        if !caller.can_act_for(&booking.user_id) {
            // Don't leak existence to other users.
            return Err(EngineError::NotFound(id));
        }
        Ok(booking.clone())
    }

    /// Bookings on one tutor's calendar; standard users only see their own.
    pub async fn bookings_for_tutor(
        &self,
        caller: &Caller,
        tutor_id: Ulid,
    ) -> Result<Vec<Booking>, EngineError> {
        let cell = self.calendar(&tutor_id)?;
        let guard = cell.read().await;
        let mut out: Vec<Booking> = guard
            .value
            .bookings
            .values()
            .filter(|b| caller.can_act_for(&b.user_id))
            .cloned()
            .collect();
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    pub async fn bookings_for_user(
        &self,
        caller: &Caller,
        user_id: &str,
    ) -> Result<Vec<Booking>, EngineError> {
        if !caller.can_act_for(user_id) {
            return Err(EngineError::Unauthorized("cannot list another user's bookings"));
        }
        let mut out = Vec::new();
        for cell in self.all_calendars() {
            let guard = cell.read().await;
            out.extend(
                guard
                    .value
                    .bookings
                    .values()
                    .filter(|b| b.user_id == user_id)
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    pub async fn sessions_for_tutor(&self, tutor_id: Ulid) -> Result<Vec<GroupSession>, EngineError> {
        let cell = self.calendar(&tutor_id)?;
        let guard = cell.read().await;
        let mut out: Vec<GroupSession> = guard.value.sessions.values().cloned().collect();
        out.sort_by_key(|s| (s.span.start, s.id));
        Ok(out)
    }

    pub async fn time_off_for_tutor(&self, tutor_id: Ulid) -> Result<Vec<TimeOff>, EngineError> {
        let cell = self.calendar(&tutor_id)?;
        let guard = cell.read().await;
        let mut out: Vec<TimeOff> = guard.value.time_off.values().cloned().collect();
        out.sort_by_key(|t| (t.span.start, t.id));
        Ok(out)
    }
}
