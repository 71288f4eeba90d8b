use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Turn raw bounds into a span, rejecting empty, inverted or absurd ones.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::InvalidInterval("span too wide"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn check_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn check_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.is_empty() {
        return Err(EngineError::InvalidInterval("user id must not be empty"));
    }
    check_text(user_id, MAX_USER_ID_LEN, "user id too long")
}

/// The error reported when `span` collides with an occupying record of `kind`.
pub(crate) fn conflict_for(kind: RecordKind, id: Ulid) -> EngineError {
    match kind {
        RecordKind::TimeOff => EngineError::TutorUnavailable(id),
        RecordKind::Booking | RecordKind::GroupSession => EngineError::SlotAlreadyBooked(id),
    }
}

/// Single pass over the occupying intervals that overlap `span`.
///
/// `exclude` skips the record being moved. When several kinds collide the
/// most specific answer wins: a booking, then a group session, then time-off.
pub(crate) fn check_no_conflict(
    cal: &TutorCalendar,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let mut session_hit = None;
    let mut time_off_hit = None;
    for interval in cal.overlapping(span) {
        if Some(interval.id) == exclude {
            continue;
        }
        match interval.kind {
            RecordKind::Booking => return Err(conflict_for(interval.kind, interval.id)),
            RecordKind::GroupSession => {
                session_hit.get_or_insert(interval.id);
            }
            RecordKind::TimeOff => {
                time_off_hit.get_or_insert(interval.id);
            }
        }
    }
    if let Some(id) = session_hit {
        return Err(conflict_for(RecordKind::GroupSession, id));
    }
    if let Some(id) = time_off_hit {
        return Err(conflict_for(RecordKind::TimeOff, id));
    }
    Ok(())
}

/// Moving a record requires at least `notice_ms` between now and its current start.
pub(crate) fn check_notice(
    current_start: Ms,
    now: Ms,
    notice_ms: Ms,
    kind: RecordKind,
) -> Result<(), EngineError> {
    if current_start - now < notice_ms {
        return Err(EngineError::RescheduleWindowClosed { kind, notice_ms });
    }
    Ok(())
}

pub(crate) fn check_not_past(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start < now {
        return Err(EngineError::InvalidInterval("start is in the past"));
    }
    Ok(())
}
