use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Identity handed to us by the auth collaborator.
pub type UserId = String;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection with `other`, if non-empty.
    pub fn clamp_to(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Standard,
    Admin,
}

/// Who is asking. Produced by the auth layer, trusted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn user(id: impl Into<UserId>) -> Self {
        Self { user_id: id.into(), role: Role::Standard }
    }

    pub fn admin(id: impl Into<UserId>) -> Self {
        Self { user_id: id.into(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act for anyone; standard users only for themselves.
    pub fn can_act_for(&self, user_id: &str) -> bool {
        self.is_admin() || self.user_id == user_id
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Booking,
    GroupSession,
    TimeOff,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Booking => "booking",
            RecordKind::GroupSession => "group_session",
            RecordKind::TimeOff => "time_off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookingStatus {
    AwaitingPayment,
    PaymentPendingConfirmation,
    Confirmed,
    CancellationRequested,
    Cancelled,
    Refunded,
    CreditIssued,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 7] = [
        BookingStatus::AwaitingPayment,
        BookingStatus::PaymentPendingConfirmation,
        BookingStatus::Confirmed,
        BookingStatus::CancellationRequested,
        BookingStatus::Cancelled,
        BookingStatus::Refunded,
        BookingStatus::CreditIssued,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::AwaitingPayment => "awaiting-payment",
            BookingStatus::PaymentPendingConfirmation => "payment-pending-confirmation",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CancellationRequested => "cancellation-requested",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Refunded => "refunded",
            BookingStatus::CreditIssued => "credit-issued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// Whether a booking in this state holds its slot on the calendar.
    pub fn is_occupying(&self) -> bool {
        matches!(
            self,
            BookingStatus::AwaitingPayment
                | BookingStatus::PaymentPendingConfirmation
                | BookingStatus::Confirmed
                | BookingStatus::CancellationRequested
        )
    }

    pub fn is_reschedulable(&self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::PaymentPendingConfirmation
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a booking's append-only audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: BookingStatus,
    pub at: Ms,
    pub actor: UserId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub user_id: UserId,
    pub lesson_type: String,
    pub price_cents: u64,
    pub span: Span,
    pub status: BookingStatus,
    pub status_history: Vec<StatusChange>,
    /// External payment ids already applied to this booking.
    pub payment_ids: BTreeSet<String>,
}

impl Booking {
    /// Set the current status and append it to the history.
    pub fn record_status(&mut self, change: StatusChange) {
        self.status = change.status;
        self.status_history.push(change);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            SessionStatus::Scheduled,
            SessionStatus::Cancelled,
            SessionStatus::Completed,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
    }

    pub fn is_occupying(&self) -> bool {
        !matches!(self, SessionStatus::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSession {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub title: String,
    pub span: Span,
    pub max_students: u32,
    /// Registration order is kept; no duplicates.
    pub participants: Vec<UserId>,
    pub status: SessionStatus,
}

impl GroupSession {
    pub fn participant_count(&self) -> u32 {
        self.participants.len() as u32
    }

    pub fn is_full(&self) -> bool {
        self.participant_count() >= self.max_students
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

/// Tutor blackout. No states: it exists or it doesn't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOff {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub span: Span,
    pub reason: String,
    pub created_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tutor {
    pub id: Ulid,
    pub name: String,
    /// Offset of the tutor's local calendar day from UTC.
    pub utc_offset_minutes: i32,
}

/// A record as returned to callers after a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Booking(Booking),
    GroupSession(GroupSession),
    TimeOff(TimeOff),
}

impl Record {
    pub fn id(&self) -> Ulid {
        match self {
            Record::Booking(b) => b.id,
            Record::GroupSession(s) => s.id,
            Record::TimeOff(t) => t.id,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Record::Booking(b) => b.span,
            Record::GroupSession(s) => s.span,
            Record::TimeOff(t) => t.span,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Booking(_) => RecordKind::Booking,
            Record::GroupSession(_) => RecordKind::GroupSession,
            Record::TimeOff(_) => RecordKind::TimeOff,
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// Kind-specific part of a `reserve` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationPayload {
    Booking {
        /// Defaults to the caller.
        user_id: Option<UserId>,
        lesson_type: String,
        price_cents: u64,
    },
    GroupSession {
        title: String,
        max_students: u32,
    },
    TimeOff {
        reason: String,
    },
}

impl ReservationPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            ReservationPayload::Booking { .. } => RecordKind::Booking,
            ReservationPayload::GroupSession { .. } => RecordKind::GroupSession,
            ReservationPayload::TimeOff { .. } => RecordKind::TimeOff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    CancellationRequested,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentProduct {
    Package { credit_type: String, lessons: u32 },
    Booking { booking_id: Ulid },
}

/// "Transaction completed" notice from the payment collaborator.
/// Signature checks happen upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    pub payment_id: String,
    pub user_id: UserId,
    pub product: PaymentProduct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Applied,
    Duplicate,
}

// ── Aggregates ───────────────────────────────────────────────────

/// Calendar index entry: an occupying record's span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: RecordKind,
}

/// Everything scheduled against one tutor.
#[derive(Debug, Clone)]
pub struct TutorCalendar {
    pub tutor: Tutor,
    pub bookings: HashMap<Ulid, Booking>,
    pub sessions: HashMap<Ulid, GroupSession>,
    pub time_off: HashMap<Ulid, TimeOff>,
    /// Occupying records only, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl TutorCalendar {
    pub fn new(tutor: Tutor) -> Self {
        Self {
            tutor,
            bookings: HashMap::new(),
            sessions: HashMap::new(),
            time_off: HashMap::new(),
            intervals: Vec::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.bookings.len() + self.sessions.len() + self.time_off.len()
    }

    pub fn contains_record(&self, id: &Ulid) -> bool {
        self.bookings.contains_key(id)
            || self.sessions.contains_key(id)
            || self.time_off.contains_key(id)
    }

    pub fn record(&self, id: &Ulid) -> Option<Record> {
        if let Some(b) = self.bookings.get(id) {
            return Some(Record::Booking(b.clone()));
        }
        if let Some(s) = self.sessions.get(id) {
            return Some(Record::GroupSession(s.clone()));
        }
        self.time_off.get(id).map(|t| Record::TimeOff(t.clone()))
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Drop any index entry for `id`, then re-add it if the record still occupies.
    pub fn reindex(&mut self, id: Ulid, span: Span, kind: RecordKind, occupying: bool) {
        self.remove_interval(id);
        if occupying {
            self.insert_interval(Interval { id, span, kind });
        }
    }

    /// Occupying intervals that overlap `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

/// Per-user credit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub credits: BTreeMap<String, u32>,
    /// Dedupe keys of side effects already applied.
    pub processed_payments: BTreeSet<String>,
}

impl Account {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }
}

// ── WAL record ───────────────────────────────────────────────────

/// One event per committed transaction. This is the WAL record format.
/// Creation events carry the whole record so compaction can re-emit current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TutorRegistered {
        tutor: Tutor,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        tutor_id: Ulid,
        span: Span,
        change: StatusChange,
    },
    BookingStatusChanged {
        id: Ulid,
        tutor_id: Ulid,
        change: StatusChange,
        payment_id: Option<String>,
    },
    GroupSessionCreated {
        session: GroupSession,
    },
    GroupSessionRescheduled {
        id: Ulid,
        tutor_id: Ulid,
        span: Span,
    },
    GroupSessionStatusChanged {
        id: Ulid,
        tutor_id: Ulid,
        status: SessionStatus,
    },
    ParticipantRegistered {
        session_id: Ulid,
        tutor_id: Ulid,
        user_id: UserId,
    },
    ParticipantUnregistered {
        session_id: Ulid,
        tutor_id: Ulid,
        user_id: UserId,
    },
    TimeOffCreated {
        time_off: TimeOff,
    },
    TimeOffRemoved {
        id: Ulid,
        tutor_id: Ulid,
    },
    CreditsGranted {
        user_id: UserId,
        credit_type: String,
        amount: u32,
        dedupe_key: String,
    },
    AccountRestored {
        account: Account,
    },
}

impl Event {
    /// The tutor calendar this event belongs to, if any.
    pub fn tutor_id(&self) -> Option<Ulid> {
        match self {
            Event::TutorRegistered { tutor } => Some(tutor.id),
            Event::BookingCreated { booking } => Some(booking.tutor_id),
            Event::GroupSessionCreated { session } => Some(session.tutor_id),
            Event::TimeOffCreated { time_off } => Some(time_off.tutor_id),
            Event::BookingRescheduled { tutor_id, .. }
            | Event::BookingStatusChanged { tutor_id, .. }
            | Event::GroupSessionRescheduled { tutor_id, .. }
            | Event::GroupSessionStatusChanged { tutor_id, .. }
            | Event::ParticipantRegistered { tutor_id, .. }
            | Event::ParticipantUnregistered { tutor_id, .. }
            | Event::TimeOffRemoved { tutor_id, .. } => Some(*tutor_id),
            Event::CreditsGranted { .. } | Event::AccountRestored { .. } => None,
        }
    }

    /// The ledger account this event belongs to, if any.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Event::CreditsGranted { user_id, .. } => Some(user_id),
            Event::AccountRestored { account } => Some(&account.user_id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityView {
    pub tutor_id: Ulid,
    /// The tutor's local calendar day.
    pub window: Span,
    /// Merged occupied time inside the window.
    pub busy: Vec<Span>,
    pub free: Vec<Span>,
}
