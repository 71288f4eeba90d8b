mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{busy_spans, day_window, free_spans, merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use mutations::ReserveRequest;
pub use store::{Aggregate, Shared, Versioned};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use store::{shared, snapshot_calendar};

// ── Group-commit WAL channel ─────────────────────────────

/// Upper bound on events fsynced together.
const MAX_COMMIT_BATCH: usize = 1024;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a batch is being assembled share
/// one fsync; control commands first flush whatever is pending.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    pending.push((event, response));
                    if pending.len() >= MAX_COMMIT_BATCH {
                        commit_pending(&mut wal, &mut pending);
                    }
                }
                WalCommand::Compact { events, response } => {
                    commit_pending(&mut wal, &mut pending);
                    let result = Wal::write_compact_file(wal.path(), &events)
                        .and_then(|()| wal.swap_compact_file());
                    let _ = response.send(result);
                }
                WalCommand::AppendsSinceCompact { response } => {
                    commit_pending(&mut wal, &mut pending);
                    let _ = response.send(wal.appends_since_compact());
                }
            }
            next = rx.try_recv().ok();
        }
        commit_pending(&mut wal, &mut pending);
    }
}

fn commit_pending(wal: &mut Wal, pending: &mut Vec<PendingAppend>) {
    if pending.is_empty() {
        return;
    }
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
    let started = std::time::Instant::now();

    let result = pending
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        warn!("wal flush of {} events failed: {e}", pending.len());
        // Every waiter is told the batch failed, so none of it may survive.
        if let Err(rollback) = wal.rollback_unsynced() {
            error!("wal rollback after failed flush also failed: {rollback}");
        }
    }
    for (_, response) in pending.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

fn apply_uncontended<T: Aggregate>(cell: &Shared<T>, event: &Event) -> bool {
    match cell.try_write() {
        Ok(mut guard) => {
            guard.value.apply(event);
            guard.version += 1;
            true
        }
        Err(_) => false,
    }
}

// ── Engine ───────────────────────────────────────────────

/// Business-rule knobs, all overridable from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub lesson_notice_ms: Ms,
    pub session_notice_ms: Ms,
    /// Validation failures tolerated before `TransactionConflict`.
    pub max_txn_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lesson_notice_ms: 12 * HOUR_MS,
            session_notice_ms: 3 * HOUR_MS,
            max_txn_retries: 8,
        }
    }
}

/// What a transaction body decided after looking at a snapshot.
pub(super) enum Txn<R> {
    /// Nothing to write; return `R` as is.
    Read(R),
    /// Commit this event, then return `R`.
    Write(Event, R),
}

pub struct Engine {
    pub(super) tutors: DashMap<Ulid, Shared<TutorCalendar>>,
    pub(super) accounts: DashMap<UserId, Shared<Account>>,
    /// Reverse lookup: record id → tutor id.
    pub(super) record_to_tutor: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold this shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss an in-flight append.
    commit_gate: RwLock<()>,
    /// Serializes tutor registration so an id is checked and appended once.
    pub(super) registration: Mutex<()>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            let valid_len = Wal::truncate_tail(&wal_path, replay.discarded_bytes)?;
            warn!(
                "wal {}: truncated to {valid_len} bytes before reopening",
                wal_path.display()
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tutors: DashMap::new(),
            accounts: DashMap::new(),
            record_to_tutor: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            registration: Mutex::new(()),
            clock,
            settings,
        };

        // Sole owner of every cell here, so try_write never contends.
        let mut skipped = 0usize;
        for event in &replay.events {
            if !engine.replay_event(event) {
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!("replay: skipped {skipped} events for unknown or already registered aggregates");
        }
        info!(
            "replayed {} events from {} ({} tutors, {} accounts)",
            replay.events.len(),
            wal_path.display(),
            engine.tutors.len(),
            engine.accounts.len()
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> bool {
        if let Event::TutorRegistered { tutor } = event {
            // First registration of an id wins.
            return match self.tutors.entry(tutor.id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(shared(TutorCalendar::new(tutor.clone())));
                    true
                }
            };
        }
        let applied = if let Some(tutor_id) = event.tutor_id() {
            match self.tutors.get(&tutor_id).map(|e| e.value().clone()) {
                Some(cell) => apply_uncontended(&cell, event),
                None => false,
            }
        } else if let Some(user_id) = event.account_id() {
            apply_uncontended(&self.account_cell(user_id), event)
        } else {
            false
        };
        if applied {
            self.index_event(event);
        }
        applied
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Keep the record → tutor index in step with committed events.
    fn index_event(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                self.record_to_tutor.insert(booking.id, booking.tutor_id);
            }
            Event::GroupSessionCreated { session } => {
                self.record_to_tutor.insert(session.id, session.tutor_id);
            }
            Event::TimeOffCreated { time_off } => {
                self.record_to_tutor.insert(time_off.id, time_off.tutor_id);
            }
            Event::TimeOffRemoved { id, .. } => {
                self.record_to_tutor.remove(id);
            }
            _ => {}
        }
    }

    pub(super) fn calendar(&self, tutor_id: &Ulid) -> Result<Shared<TutorCalendar>, EngineError> {
        self.tutors
            .get(tutor_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*tutor_id))
    }

    /// Lookup record → tutor, then the tutor's calendar.
    pub(super) fn calendar_for_record(
        &self,
        record_id: &Ulid,
    ) -> Result<Shared<TutorCalendar>, EngineError> {
        let tutor_id = self
            .record_to_tutor
            .get(record_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*record_id))?;
        self.calendar(&tutor_id)
    }

    pub(super) fn account_cell(&self, user_id: &str) -> Shared<Account> {
        if let Some(entry) = self.accounts.get(user_id) {
            return entry.value().clone();
        }
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| shared(Account::new(user_id.to_string())))
            .value()
            .clone()
    }

    /// Append an event that creates a cell rather than changing one;
    /// `install` runs after the append, still inside the commit gate.
    pub(super) async fn persist_then(
        &self,
        event: &Event,
        install: impl FnOnce(),
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        install();
        Ok(())
    }

    /// Optimistic read-validate-commit against one aggregate.
    ///
    /// `body` runs on a snapshot with no lock held across its decision and
    /// may run several times. The commit only happens if nobody else
    /// committed to the same aggregate in between.
    pub(super) async fn transact<T, R, F>(
        &self,
        cell: &Shared<T>,
        op: &'static str,
        mut body: F,
    ) -> Result<R, EngineError>
    where
        T: Aggregate,
        F: FnMut(&T, Ms) -> Result<Txn<R>, EngineError>,
    {
        for attempt in 0..=self.settings.max_txn_retries {
            let now = self.clock.now_ms();
            let (read_version, decision) = {
                let snapshot = cell.read().await;
                (snapshot.version, body(&snapshot.value, now)?)
            };
            let (event, out) = match decision {
                Txn::Read(out) => return Ok(out),
                Txn::Write(event, out) => (event, out),
            };

            let _gate = self.commit_gate.read().await;
            let mut guard = cell.write().await;
            if guard.version != read_version {
                metrics::counter!(observability::TXN_RETRIES_TOTAL, "op" => op).increment(1);
                debug!(
                    "{op}: snapshot v{read_version} went stale (now v{}), attempt {}",
                    guard.version,
                    attempt + 1
                );
                continue;
            }
            self.wal_append(&event).await?;
            guard.value.apply(&event);
            guard.version += 1;
            drop(guard);
            self.index_event(&event);
            return Ok(out);
        }
        metrics::counter!(observability::TXN_CONFLICTS_TOTAL, "op" => op).increment(1);
        warn!(
            "{op}: gave up after {} stale snapshots",
            self.settings.max_txn_retries + 1
        );
        Err(EngineError::TransactionConflict)
    }

    /// Rewrite the WAL as one snapshot event per live tutor, record and account.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let calendars: Vec<Shared<TutorCalendar>> =
            self.tutors.iter().map(|e| e.value().clone()).collect();
        let accounts: Vec<Shared<Account>> =
            self.accounts.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for cell in &calendars {
            let guard = cell.read().await;
            events.extend(snapshot_calendar(&guard.value));
        }
        for cell in &accounts {
            let guard = cell.read().await;
            if guard.value != Account::new(guard.value.user_id.clone()) {
                events.push(Event::AccountRestored {
                    account: guard.value.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("wal compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
