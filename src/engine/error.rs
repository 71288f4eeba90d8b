use ulid::Ulid;

use crate::model::{BookingStatus, Ms, RecordKind, HOUR_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidInterval(&'static str),
    Unauthorized(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Overlaps an occupying booking or group session.
    SlotAlreadyBooked(Ulid),
    /// Overlaps tutor time-off.
    TutorUnavailable(Ulid),
    RescheduleWindowClosed { kind: RecordKind, notice_ms: Ms },
    NotReschedulable(Ulid),
    NotCancellable(Ulid),
    InvalidTransition { from: String, to: String },
    SessionFull { max_students: u32 },
    AlreadyRegistered(Ulid),
    NotRegistered(Ulid),
    /// Group session no longer open for registration changes.
    SessionClosed(Ulid),
    LimitExceeded(&'static str),
    /// Optimistic commit kept losing to concurrent writers.
    TransactionConflict,
    WalError(String),
}

impl EngineError {
    pub(crate) fn transition(from: BookingStatus, to: BookingStatus) -> Self {
        EngineError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotAlreadyBooked(_) => "slot_already_booked",
            EngineError::TutorUnavailable(_) => "tutor_unavailable",
            EngineError::RescheduleWindowClosed { .. } => "reschedule_window_closed",
            EngineError::NotReschedulable(_) => "not_reschedulable",
            EngineError::NotCancellable(_) => "not_cancellable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::SessionFull { .. } => "session_full",
            EngineError::AlreadyRegistered(_) => "already_registered",
            EngineError::NotRegistered(_) => "not_registered",
            EngineError::SessionClosed(_) => "session_closed",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::TransactionConflict => "transaction_conflict",
            EngineError::WalError(_) => "storage_error",
        }
    }

    /// Sentence fit to show the person who made the request.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::SlotAlreadyBooked(_) | EngineError::TutorUnavailable(_) => {
                "This time is no longer available, please choose another.".into()
            }
            EngineError::RescheduleWindowClosed { kind, notice_ms } => {
                let what = match kind {
                    RecordKind::GroupSession => "Group sessions",
                    _ => "Lessons",
                };
                format!(
                    "{what} can only be rescheduled at least {} hours before they start.",
                    notice_ms / HOUR_MS
                )
            }
            EngineError::NotReschedulable(_) => {
                "This reservation can no longer be rescheduled.".into()
            }
            EngineError::NotCancellable(_) => "This reservation can no longer be cancelled.".into(),
            EngineError::SessionFull { .. } => "This group session is full.".into(),
            EngineError::SessionClosed(_) => {
                "Registration for this group session is closed.".into()
            }
            EngineError::Unauthorized(_) => "You are not allowed to do that.".into(),
            EngineError::NotFound(_) => "That reservation does not exist.".into(),
            EngineError::TransactionConflict | EngineError::WalError(_) => {
                "Something went wrong, please try again.".into()
            }
            other => other.to_string(),
        }
    }

    /// Transient failures a caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransactionConflict | EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval(why) => write!(f, "invalid interval: {why}"),
            EngineError::Unauthorized(why) => write!(f, "unauthorized: {why}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotAlreadyBooked(id) => write!(f, "slot already booked by {id}"),
            EngineError::TutorUnavailable(id) => write!(f, "tutor unavailable (time off {id})"),
            EngineError::RescheduleWindowClosed { kind, notice_ms } => write!(
                f,
                "reschedule window closed: {} needs {}h notice",
                kind.as_str(),
                notice_ms / HOUR_MS
            ),
            EngineError::NotReschedulable(id) => write!(f, "not reschedulable: {id}"),
            EngineError::NotCancellable(id) => write!(f, "not cancellable: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition {from} -> {to}")
            }
            EngineError::SessionFull { max_students } => {
                write!(f, "session full: {max_students} students")
            }
            EngineError::AlreadyRegistered(id) => write!(f, "already registered for {id}"),
            EngineError::NotRegistered(id) => write!(f, "not registered for {id}"),
            EngineError::SessionClosed(id) => write!(f, "session closed: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::TransactionConflict => {
                write!(f, "transaction conflict: too many concurrent writers, retry")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

