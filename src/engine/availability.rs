use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_UTC_OFFSET_MINUTES;
use crate::model::*;

use super::{Engine, EngineError};

// ── Availability Algorithm ────────────────────────────────────────

/// The tutor's local calendar day `[00:00, 24:00)` expressed in UTC millis.
pub fn day_window(day: NaiveDate, utc_offset_minutes: i32) -> Result<Span, EngineError> {
    if utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(EngineError::InvalidInterval("utc offset out of range"));
    }
    let utc_midnight = day
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or(EngineError::InvalidInterval("day out of range"))?;
    let start = utc_midnight - Ms::from(utc_offset_minutes) * MINUTE_MS;
    Ok(Span::new(start, start + DAY_MS))
}

/// Occupied time inside `window`: every occupying record clamped, sorted, merged.
pub fn busy_spans(cal: &TutorCalendar, window: &Span) -> Vec<Span> {
    // The index is sorted by start, so clamping keeps the order.
    let clamped: Vec<Span> = cal
        .overlapping(window)
        .filter_map(|i| i.span.clamp_to(window))
        .collect();
    merge_overlapping(&clamped)
}

/// `window` minus `busy`, dropping gaps shorter than `min_free_ms`.
pub fn free_spans(window: &Span, busy: &[Span], min_free_ms: Option<Ms>) -> Vec<Span> {
    let mut free = subtract_intervals(std::slice::from_ref(window), busy);
    if let Some(min) = min_free_ms {
        free.retain(|s| s.duration_ms() >= min);
    }
    free
}

/// Union of spans sorted by start. Touching spans are joined.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(*span),
        }
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut first_relevant = 0;

    for b in base {
        let mut cursor = b.start;
        while first_relevant < to_remove.len() && to_remove[first_relevant].end <= cursor {
            first_relevant += 1;
        }
        for r in to_remove[first_relevant..]
            .iter()
            .take_while(|r| r.start < b.end)
        {
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }
    result
}

impl Engine {
    /// Busy and free time for one tutor day. Advisory only: nothing is held,
    /// `reserve` re-checks under its own transaction.
    pub async fn availability_view(
        &self,
        tutor_id: Ulid,
        day: NaiveDate,
        min_free_ms: Option<Ms>,
    ) -> Result<AvailabilityView, EngineError> {
        if let Some(min) = min_free_ms
            && min <= 0
        {
            return Err(EngineError::InvalidInterval("min_duration must be positive"));
        }
        let cell = self.calendar(&tutor_id)?;
        let guard = cell.read().await;
        let cal = &guard.value;
        let window = day_window(day, cal.tutor.utc_offset_minutes)?;
        let busy = busy_spans(cal, &window);
        let free = free_spans(&window, &busy, min_free_ms);
        Ok(AvailabilityView {
            tutor_id,
            window,
            busy,
            free,
        })
    }
}
