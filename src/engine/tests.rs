use super::*;
use crate::clock::ManualClock;

const H: Ms = HOUR_MS;
const M: Ms = MINUTE_MS;

/// 2024-06-01T00:00:00Z
const DAY: Ms = 1_717_200_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotguard_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn admin() -> Caller {
    Caller::admin("ops")
}

fn alice() -> Caller {
    Caller::user("alice")
}

/// Engine whose clock reads the day before `DAY` at 08:00 unless moved.
fn engine_with(name: &str, settings: EngineSettings) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(DAY - 16 * H));
    let engine = Engine::new(test_wal_path(name), settings, clock.clone()).unwrap();
    (engine, clock)
}

fn engine(name: &str) -> (Engine, Arc<ManualClock>) {
    engine_with(name, EngineSettings::default())
}

async fn tutor(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .register_tutor(
            &admin(),
            Tutor {
                id,
                name: "Ana".into(),
                utc_offset_minutes: 0,
            },
        )
        .await
        .unwrap();
    id
}

fn lesson(tutor_id: Ulid, start: Ms, end: Ms) -> ReserveRequest {
    ReserveRequest {
        id: None,
        tutor_id,
        start,
        end,
        payload: ReservationPayload::Booking {
            user_id: None,
            lesson_type: "standard".into(),
            price_cents: 4_000,
        },
    }
}

fn session(tutor_id: Ulid, start: Ms, end: Ms, max_students: u32) -> ReserveRequest {
    ReserveRequest {
        id: None,
        tutor_id,
        start,
        end,
        payload: ReservationPayload::GroupSession {
            title: "Conversation club".into(),
            max_students,
        },
    }
}

fn time_off(tutor_id: Ulid, start: Ms, end: Ms) -> ReserveRequest {
    ReserveRequest {
        id: None,
        tutor_id,
        start,
        end,
        payload: ReservationPayload::TimeOff {
            reason: "dentist".into(),
        },
    }
}

async fn status_of(engine: &Engine, id: Ulid) -> BookingStatus {
    engine.get_booking(&admin(), id).await.unwrap().status
}

// ── Tutors ───────────────────────────────────────────────

#[tokio::test]
async fn only_admins_register_tutors() {
    let (engine, _) = engine("tutor_admin_only.wal");
    let result = engine
        .register_tutor(
            &alice(),
            Tutor {
                id: Ulid::new(),
                name: "Ana".into(),
                utc_offset_minutes: 0,
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    assert!(engine.list_tutors().await.is_empty());
}

#[tokio::test]
async fn duplicate_tutor_rejected() {
    let (engine, _) = engine("tutor_dup.wal");
    let id = tutor(&engine).await;
    let result = engine
        .register_tutor(
            &admin(),
            Tutor {
                id,
                name: "Again".into(),
                utc_offset_minutes: 0,
            },
        )
        .await;
    assert_eq!(result, Err(EngineError::AlreadyExists(id)));
    assert_eq!(engine.get_tutor(id).await.unwrap().name, "Ana");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_registration_keeps_first() {
    let path = test_wal_path("tutor_dup_race.wal");
    let clock = Arc::new(ManualClock::new(DAY - 16 * H));
    let id = Ulid::new();
    let live = {
        let engine = Arc::new(
            Engine::new(path.clone(), EngineSettings::default(), clock.clone()).unwrap(),
        );
        let mut handles = Vec::new();
        for i in 0..8 {
            let eng = engine.clone();
            handles.push(tokio::spawn(async move {
                let tutor = Tutor {
                    id,
                    name: format!("N{i}"),
                    utc_offset_minutes: i * 60,
                };
                eng.register_tutor(&admin(), tutor).await
            }));
        }
        let mut wins = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => wins += 1,
                Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        engine.get_tutor(id).await.unwrap()
    };

    let engine = Engine::new(path, EngineSettings::default(), clock).unwrap();
    assert_eq!(engine.get_tutor(id).await.unwrap(), live);
}

// ── Reserve ──────────────────────────────────────────────

#[tokio::test]
async fn overlapping_booking_rejected_adjacent_accepted() {
    let (engine, _) = engine("overlap_adjacent.wal");
    let t = tutor(&engine).await;
    let first = engine
        .reserve(&alice(), lesson(t, DAY + 14 * H, DAY + 15 * H))
        .await
        .unwrap();

    let bob = Caller::user("bob");
    let clash = engine
        .reserve(&bob, lesson(t, DAY + 14 * H + 30 * M, DAY + 15 * H + 30 * M))
        .await;
    assert_eq!(clash, Err(EngineError::SlotAlreadyBooked(first)));

    engine
        .reserve(&bob, lesson(t, DAY + 15 * H, DAY + 16 * H))
        .await
        .unwrap();
    assert_eq!(engine.bookings_for_tutor(&admin(), t).await.unwrap().len(), 2);
}

#[tokio::test]
async fn time_off_makes_tutor_unavailable() {
    let (engine, _) = engine("time_off_blocks.wal");
    let t = tutor(&engine).await;
    let off = engine
        .reserve(&admin(), time_off(t, DAY + 9 * H, DAY + 12 * H))
        .await
        .unwrap();

    let result = engine
        .reserve(&alice(), lesson(t, DAY + 11 * H, DAY + 11 * H + 30 * M))
        .await;
    assert_eq!(result, Err(EngineError::TutorUnavailable(off)));
    assert_eq!(
        result.unwrap_err().user_message(),
        "This time is no longer available, please choose another."
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_reserves_one_wins() {
    let (engine, _) = engine("concurrent_identical.wal");
    let engine = Arc::new(engine);
    let t = tutor(&engine).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let caller = Caller::user(format!("student{i}"));
            eng.reserve(&caller, lesson(t, DAY + 10 * H, DAY + 11 * H)).await
        }));
    }

    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::SlotAlreadyBooked(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(engine.bookings_for_tutor(&admin(), t).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_reserves_all_commit() {
    let settings = EngineSettings {
        max_txn_retries: 64,
        ..EngineSettings::default()
    };
    let (engine, _) = engine_with("concurrent_disjoint.wal", settings);
    let engine = Arc::new(engine);
    let t = tutor(&engine).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let start = DAY + i * H;
            eng.reserve(&alice(), lesson(t, start, start + H)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let bookings = engine.bookings_for_tutor(&admin(), t).await.unwrap();
    assert_eq!(bookings.len(), 20);
    for pair in bookings.windows(2) {
        assert!(!pair[0].span.overlaps(&pair[1].span));
    }
}

#[tokio::test]
async fn booking_beats_session_beats_time_off() {
    let (engine, _) = engine("precedence.wal");
    let t = tutor(&engine).await;
    engine
        .reserve(&admin(), time_off(t, DAY + 8 * H, DAY + 9 * H))
        .await
        .unwrap();
    let sid = engine
        .reserve(&admin(), session(t, DAY + 9 * H, DAY + 10 * H, 4))
        .await
        .unwrap();
    let bid = engine
        .reserve(&alice(), lesson(t, DAY + 10 * H, DAY + 11 * H))
        .await
        .unwrap();

    let everything = engine
        .reserve(&admin(), time_off(t, DAY + 8 * H, DAY + 11 * H))
        .await;
    assert_eq!(everything, Err(EngineError::SlotAlreadyBooked(bid)));
    let two = engine
        .reserve(&admin(), time_off(t, DAY + 8 * H, DAY + 10 * H))
        .await;
    assert_eq!(two, Err(EngineError::SlotAlreadyBooked(sid)));
}

#[tokio::test]
async fn invalid_intervals_rejected() {
    let (engine, _) = engine("invalid_interval.wal");
    let t = tutor(&engine).await;
    for (start, end) in [(DAY + H, DAY + H), (DAY + 2 * H, DAY + H), (0, H)] {
        let result = engine.reserve(&alice(), lesson(t, start, end)).await;
        assert!(
            matches!(result, Err(EngineError::InvalidInterval(_))),
            "{start}..{end}: {result:?}"
        );
    }
}

#[tokio::test]
async fn past_start_rejected_except_time_off() {
    let (engine, clock) = engine("past_start.wal");
    let t = tutor(&engine).await;
    clock.set(DAY + 12 * H);

    let result = engine.reserve(&alice(), lesson(t, DAY + 9 * H, DAY + 10 * H)).await;
    assert!(matches!(result, Err(EngineError::InvalidInterval(_))));

    engine
        .reserve(&admin(), time_off(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn standard_users_limited_to_own_bookings() {
    let (engine, _) = engine("permissions.wal");
    let t = tutor(&engine).await;

    let mut for_bob = lesson(t, DAY + 9 * H, DAY + 10 * H);
    for_bob.payload = ReservationPayload::Booking {
        user_id: Some("bob".into()),
        lesson_type: "standard".into(),
        price_cents: 4_000,
    };
    let result = engine.reserve(&alice(), for_bob.clone()).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));

    let result = engine.reserve(&alice(), time_off(t, DAY, DAY + H)).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    let result = engine.reserve(&alice(), session(t, DAY, DAY + H, 3)).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));

    // Admins may book on someone's behalf.
    let id = engine.reserve(&admin(), for_bob).await.unwrap();
    assert_eq!(engine.get_booking(&admin(), id).await.unwrap().user_id, "bob");
}

#[tokio::test]
async fn unknown_tutor_and_duplicate_id() {
    let (engine, _) = engine("unknown_tutor.wal");
    let ghost = Ulid::new();
    let result = engine.reserve(&alice(), lesson(ghost, DAY, DAY + H)).await;
    assert_eq!(result, Err(EngineError::NotFound(ghost)));

    let t = tutor(&engine).await;
    let mut req = lesson(t, DAY, DAY + H);
    let id = Ulid::new();
    req.id = Some(id);
    engine.reserve(&alice(), req.clone()).await.unwrap();
    req.start = DAY + 5 * H;
    req.end = DAY + 6 * H;
    assert_eq!(
        engine.reserve(&alice(), req).await,
        Err(EngineError::AlreadyExists(id))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn record_id_is_unique_across_tutors() {
    let (engine, _) = engine("record_id_across_tutors.wal");
    let engine = Arc::new(engine);
    let t1 = tutor(&engine).await;
    let t2 = tutor(&engine).await;
    let id = Ulid::new();

    let mut handles = Vec::new();
    for t in [t1, t2] {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut req = lesson(t, DAY + 10 * H, DAY + 11 * H);
            req.id = Some(id);
            eng.reserve(&alice(), req).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(wins, 1);
    let on_t1 = engine.bookings_for_tutor(&admin(), t1).await.unwrap().len();
    let on_t2 = engine.bookings_for_tutor(&admin(), t2).await.unwrap().len();
    assert_eq!(on_t1 + on_t2, 1);
    // Whichever tutor won, the id still resolves to it.
    engine.cancel(&admin(), id, None).await.unwrap();
}

#[tokio::test]
async fn rejected_reserve_releases_its_id() {
    let (engine, _) = engine("rejected_releases_id.wal");
    let t = tutor(&engine).await;
    engine
        .reserve(&alice(), lesson(t, DAY + 10 * H, DAY + 11 * H))
        .await
        .unwrap();

    let id = Ulid::new();
    let mut clash = lesson(t, DAY + 10 * H, DAY + 11 * H);
    clash.id = Some(id);
    assert!(matches!(
        engine.reserve(&Caller::user("bob"), clash).await,
        Err(EngineError::SlotAlreadyBooked(_))
    ));
    assert_eq!(
        engine.get_booking(&admin(), id).await.map(|b| b.id),
        Err(EngineError::NotFound(id))
    );

    let mut free = lesson(t, DAY + 12 * H, DAY + 13 * H);
    free.id = Some(id);
    assert_eq!(engine.reserve(&Caller::user("bob"), free).await, Ok(id));
}

#[tokio::test]
async fn initial_status_depends_on_price() {
    let (engine, _) = engine("initial_status.wal");
    let t = tutor(&engine).await;
    let paid = engine.reserve(&alice(), lesson(t, DAY, DAY + H)).await.unwrap();
    let mut trial = lesson(t, DAY + H, DAY + 2 * H);
    trial.payload = ReservationPayload::Booking {
        user_id: None,
        lesson_type: "trial".into(),
        price_cents: 0,
    };
    let free = engine.reserve(&alice(), trial).await.unwrap();

    assert_eq!(status_of(&engine, paid).await, BookingStatus::AwaitingPayment);
    let booking = engine.get_booking(&alice(), free).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.status_history.len(), 1);
    assert_eq!(booking.status_history[0].actor, "alice");
}

// ── Reschedule ───────────────────────────────────────────

async fn confirmed_booking(engine: &Engine, t: Ulid, start: Ms, end: Ms) -> Ulid {
    let id = engine.reserve(&alice(), lesson(t, start, end)).await.unwrap();
    engine
        .apply_payment(
            &admin(),
            PaymentNotice {
                payment_id: format!("pay-{id}"),
                user_id: "alice".into(),
                product: PaymentProduct::Booking { booking_id: id },
            },
        )
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn reschedule_inside_notice_window_rejected() {
    let (engine, clock) = engine("reschedule_window.wal");
    let t = tutor(&engine).await;
    let id = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;

    clock.set(DAY + 8 * H);
    let result = engine
        .reschedule(&alice(), id, DAY + 15 * H, DAY + 16 * H)
        .await;
    assert_eq!(
        result,
        Err(EngineError::RescheduleWindowClosed {
            kind: RecordKind::Booking,
            notice_ms: 12 * H
        })
    );
    let msg = result.unwrap_err().user_message();
    assert!(msg.contains("12 hours"), "{msg}");
}

#[tokio::test]
async fn reschedule_may_overlap_itself() {
    let (engine, _) = engine("reschedule_self.wal");
    let t = tutor(&engine).await;
    let id = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;

    let moved = engine
        .reschedule(&alice(), id, DAY + 9 * H + 30 * M, DAY + 10 * H + 30 * M)
        .await
        .unwrap();
    let Record::Booking(b) = moved else {
        panic!("expected booking")
    };
    assert_eq!(b.span, Span::new(DAY + 9 * H + 30 * M, DAY + 10 * H + 30 * M));
    assert_eq!(b.status, BookingStatus::Confirmed);

    let stored = engine.get_booking(&alice(), id).await.unwrap();
    let last = stored.status_history.last().unwrap();
    assert_eq!(last.status, BookingStatus::Confirmed);
    assert_eq!(
        last.reason.as_deref(),
        Some(format!("rescheduled from {}", Span::new(DAY + 9 * H, DAY + 10 * H)).as_str())
    );
}

#[tokio::test]
async fn reschedule_into_another_booking_rejected() {
    let (engine, _) = engine("reschedule_clash.wal");
    let t = tutor(&engine).await;
    let a = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;
    let b = confirmed_booking(&engine, t, DAY + 11 * H, DAY + 12 * H).await;

    let result = engine.reschedule(&alice(), a, DAY + 11 * H, DAY + 12 * H).await;
    assert_eq!(result, Err(EngineError::SlotAlreadyBooked(b)));
    // The failed move left the original slot in place.
    let still = engine
        .reserve(&Caller::user("bob"), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await;
    assert_eq!(still, Err(EngineError::SlotAlreadyBooked(a)));
}

#[tokio::test]
async fn reschedule_frees_old_slot() {
    let (engine, _) = engine("reschedule_frees.wal");
    let t = tutor(&engine).await;
    let a = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;
    engine
        .reschedule(&alice(), a, DAY + 13 * H, DAY + 14 * H)
        .await
        .unwrap();
    engine
        .reserve(&Caller::user("bob"), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn reschedule_requires_reschedulable_status() {
    let (engine, _) = engine("reschedule_status.wal");
    let t = tutor(&engine).await;
    let unpaid = engine
        .reserve(&alice(), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    let result = engine.reschedule(&alice(), unpaid, DAY + 13 * H, DAY + 14 * H).await;
    assert_eq!(result, Err(EngineError::NotReschedulable(unpaid)));

    engine.mark_payment_pending(&alice(), unpaid).await.unwrap();
    engine
        .reschedule(&alice(), unpaid, DAY + 13 * H, DAY + 14 * H)
        .await
        .unwrap();
    assert_eq!(
        status_of(&engine, unpaid).await,
        BookingStatus::PaymentPendingConfirmation
    );
}

#[tokio::test]
async fn reschedule_someone_elses_booking_rejected() {
    let (engine, _) = engine("reschedule_other.wal");
    let t = tutor(&engine).await;
    let id = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;
    let result = engine
        .reschedule(&Caller::user("mallory"), id, DAY + 13 * H, DAY + 14 * H)
        .await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
}

#[tokio::test]
async fn group_session_notice_is_shorter() {
    let (engine, clock) = engine("reschedule_session.wal");
    let t = tutor(&engine).await;
    let sid = engine
        .reserve(&admin(), session(t, DAY + 12 * H, DAY + 13 * H, 5))
        .await
        .unwrap();

    // 4h ahead: too late for a lesson, fine for a session.
    clock.set(DAY + 8 * H);
    engine
        .reschedule(&admin(), sid, DAY + 14 * H, DAY + 15 * H)
        .await
        .unwrap();

    clock.set(DAY + 12 * H);
    let result = engine.reschedule(&admin(), sid, DAY + 16 * H, DAY + 17 * H).await;
    assert_eq!(
        result,
        Err(EngineError::RescheduleWindowClosed {
            kind: RecordKind::GroupSession,
            notice_ms: 3 * H
        })
    );
}

#[tokio::test]
async fn time_off_is_not_reschedulable() {
    let (engine, _) = engine("reschedule_time_off.wal");
    let t = tutor(&engine).await;
    let off = engine
        .reserve(&admin(), time_off(t, DAY + 9 * H, DAY + 12 * H))
        .await
        .unwrap();
    let result = engine.reschedule(&admin(), off, DAY + 13 * H, DAY + 14 * H).await;
    assert_eq!(result, Err(EngineError::NotReschedulable(off)));
}

// ── Cancel & resolve ─────────────────────────────────────

#[tokio::test]
async fn owner_cancels_unpaid_booking_outright() {
    let (engine, _) = engine("cancel_unpaid.wal");
    let t = tutor(&engine).await;
    let id = engine
        .reserve(&alice(), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();

    let outcome = engine.cancel(&alice(), id, None).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);
    assert_eq!(status_of(&engine, id).await, BookingStatus::Cancelled);

    // Slot is free again and a second cancel is refused.
    engine
        .reserve(&Caller::user("bob"), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    assert_eq!(
        engine.cancel(&alice(), id, None).await,
        Err(EngineError::NotCancellable(id))
    );
}

#[tokio::test]
async fn paid_cancellation_goes_through_resolution() {
    let (engine, _) = engine("cancel_paid.wal");
    let t = tutor(&engine).await;
    let id = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;

    let outcome = engine
        .cancel(&alice(), id, Some("travelling".into()))
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::CancellationRequested);
    // Still holds the slot until resolved.
    let clash = engine
        .reserve(&Caller::user("bob"), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await;
    assert_eq!(clash, Err(EngineError::SlotAlreadyBooked(id)));

    let result = engine
        .resolve_cancellation(&alice(), id, BookingStatus::Refunded, None)
        .await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));

    let booking = engine
        .resolve_cancellation(&admin(), id, BookingStatus::CreditIssued, None)
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::CreditIssued);
    let credits = engine.credits(&alice(), "alice").await.unwrap();
    assert_eq!(credits.get("standard"), Some(&1));

    // Resolving again finishes nothing new and never double-credits.
    engine
        .resolve_cancellation(&admin(), id, BookingStatus::CreditIssued, None)
        .await
        .unwrap();
    assert_eq!(
        engine.credits(&alice(), "alice").await.unwrap().get("standard"),
        Some(&1)
    );
    let refund = engine
        .resolve_cancellation(&admin(), id, BookingStatus::Refunded, None)
        .await;
    assert!(matches!(refund, Err(EngineError::InvalidTransition { .. })));

    engine
        .reserve(&Caller::user("bob"), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn admin_cancel_is_immediate() {
    let (engine, _) = engine("cancel_admin.wal");
    let t = tutor(&engine).await;
    let id = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;
    let outcome = engine.cancel(&admin(), id, Some("tutor ill".into())).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);
    let b = engine.get_booking(&alice(), id).await.unwrap();
    assert_eq!(b.status, BookingStatus::Cancelled);
    assert_eq!(b.status_history.last().unwrap().actor, "ops");
}

#[tokio::test]
async fn resolve_requires_pending_request() {
    let (engine, _) = engine("resolve_pending.wal");
    let t = tutor(&engine).await;
    let id = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;
    let result = engine
        .resolve_cancellation(&admin(), id, BookingStatus::Refunded, None)
        .await;
    assert_eq!(
        result,
        Err(EngineError::transition(
            BookingStatus::Confirmed,
            BookingStatus::Refunded
        ))
    );
    let bad_target = engine
        .resolve_cancellation(&admin(), id, BookingStatus::Confirmed, None)
        .await;
    assert!(matches!(bad_target, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn removing_time_off_frees_the_slot() {
    let (engine, _) = engine("remove_time_off.wal");
    let t = tutor(&engine).await;
    let off = engine
        .reserve(&admin(), time_off(t, DAY + 9 * H, DAY + 12 * H))
        .await
        .unwrap();
    assert!(matches!(
        engine.cancel(&alice(), off, None).await,
        Err(EngineError::Unauthorized(_))
    ));
    assert_eq!(
        engine.cancel(&admin(), off, None).await,
        Ok(CancelOutcome::Removed)
    );
    assert!(engine.time_off_for_tutor(t).await.unwrap().is_empty());
    engine
        .reserve(&alice(), lesson(t, DAY + 10 * H, DAY + 11 * H))
        .await
        .unwrap();
    assert_eq!(
        engine.cancel(&admin(), off, None).await,
        Err(EngineError::NotFound(off))
    );
}

// ── Group sessions ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_respects_capacity() {
    let (engine, _) = engine("session_capacity.wal");
    let engine = Arc::new(engine);
    let t = tutor(&engine).await;
    let sid = engine
        .reserve(&admin(), session(t, DAY + 18 * H, DAY + 19 * H, 3))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let caller = Caller::user(format!("student{i}"));
            eng.register_participant(&caller, sid, None).await
        }));
    }
    let mut joined = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => joined += 1,
            Err(EngineError::SessionFull { max_students: 3 }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(joined, 3);
    let sessions = engine.sessions_for_tutor(t).await.unwrap();
    assert_eq!(sessions[0].participants.len(), 3);
}

#[tokio::test]
async fn registration_rules() {
    let (engine, clock) = engine("session_rules.wal");
    let t = tutor(&engine).await;
    let sid = engine
        .reserve(&admin(), session(t, DAY + 18 * H, DAY + 19 * H, 2))
        .await
        .unwrap();

    engine.register_participant(&alice(), sid, None).await.unwrap();
    assert_eq!(
        engine.register_participant(&alice(), sid, None).await,
        Err(EngineError::AlreadyRegistered(sid))
    );
    assert!(matches!(
        engine
            .register_participant(&alice(), sid, Some("bob".into()))
            .await,
        Err(EngineError::Unauthorized(_))
    ));
    assert_eq!(
        engine
            .unregister_participant(&Caller::user("bob"), sid, None)
            .await,
        Err(EngineError::NotRegistered(sid))
    );
    let s = engine.unregister_participant(&alice(), sid, None).await.unwrap();
    assert!(s.participants.is_empty());

    clock.set(DAY + 18 * H);
    assert_eq!(
        engine.register_participant(&alice(), sid, None).await,
        Err(EngineError::SessionClosed(sid))
    );
}

#[tokio::test]
async fn cancelled_session_frees_slot_and_closes() {
    let (engine, _) = engine("session_cancel.wal");
    let t = tutor(&engine).await;
    let sid = engine
        .reserve(&admin(), session(t, DAY + 18 * H, DAY + 19 * H, 2))
        .await
        .unwrap();
    let clash = engine
        .reserve(&alice(), lesson(t, DAY + 18 * H, DAY + 19 * H))
        .await;
    assert_eq!(clash, Err(EngineError::SlotAlreadyBooked(sid)));

    assert!(matches!(
        engine.cancel(&alice(), sid, None).await,
        Err(EngineError::Unauthorized(_))
    ));
    assert_eq!(
        engine.cancel(&admin(), sid, None).await,
        Ok(CancelOutcome::Cancelled)
    );
    assert_eq!(
        engine.register_participant(&alice(), sid, None).await,
        Err(EngineError::SessionClosed(sid))
    );
    engine
        .reserve(&alice(), lesson(t, DAY + 18 * H, DAY + 19 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn completed_session_keeps_its_slot() {
    let (engine, _) = engine("session_complete.wal");
    let t = tutor(&engine).await;
    let sid = engine
        .reserve(&admin(), session(t, DAY + 18 * H, DAY + 19 * H, 2))
        .await
        .unwrap();
    let done = engine.complete_session(&admin(), sid).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(matches!(
        engine.complete_session(&admin(), sid).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert_eq!(
        engine.cancel(&admin(), sid, None).await,
        Err(EngineError::NotCancellable(sid))
    );
    let clash = engine
        .reserve(&alice(), lesson(t, DAY + 18 * H, DAY + 19 * H))
        .await;
    assert_eq!(clash, Err(EngineError::SlotAlreadyBooked(sid)));
}

// ── Payments ─────────────────────────────────────────────

#[tokio::test]
async fn booking_payment_applies_once() {
    let (engine, _) = engine("payment_booking.wal");
    let t = tutor(&engine).await;
    let id = engine
        .reserve(&alice(), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    engine.mark_payment_pending(&alice(), id).await.unwrap();

    let notice = PaymentNotice {
        payment_id: "pi_123".into(),
        user_id: "alice".into(),
        product: PaymentProduct::Booking { booking_id: id },
    };
    assert_eq!(
        engine.apply_payment(&admin(), notice.clone()).await,
        Ok(PaymentOutcome::Applied)
    );
    assert_eq!(
        engine.apply_payment(&admin(), notice).await,
        Ok(PaymentOutcome::Duplicate)
    );

    let b = engine.get_booking(&alice(), id).await.unwrap();
    assert_eq!(b.status, BookingStatus::Confirmed);
    let statuses: Vec<_> = b.status_history.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![
            BookingStatus::AwaitingPayment,
            BookingStatus::PaymentPendingConfirmation,
            BookingStatus::Confirmed
        ]
    );
    assert_eq!(b.status_history[2].actor, "payment");
}

#[tokio::test]
async fn booking_payment_checks_owner_and_status() {
    let (engine, _) = engine("payment_checks.wal");
    let t = tutor(&engine).await;
    let id = engine
        .reserve(&alice(), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    let wrong_user = PaymentNotice {
        payment_id: "pi_1".into(),
        user_id: "bob".into(),
        product: PaymentProduct::Booking { booking_id: id },
    };
    assert!(matches!(
        engine.apply_payment(&admin(), wrong_user).await,
        Err(EngineError::Unauthorized(_))
    ));

    engine.cancel(&alice(), id, None).await.unwrap();
    let late = PaymentNotice {
        payment_id: "pi_2".into(),
        user_id: "alice".into(),
        product: PaymentProduct::Booking { booking_id: id },
    };
    assert!(matches!(
        engine.apply_payment(&admin(), late).await,
        Err(EngineError::InvalidTransition { .. })
    ));

    let not_admin = PaymentNotice {
        payment_id: "pi_3".into(),
        user_id: "alice".into(),
        product: PaymentProduct::Booking { booking_id: id },
    };
    assert!(matches!(
        engine.apply_payment(&alice(), not_admin).await,
        Err(EngineError::Unauthorized(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn package_payment_replays_are_ignored() {
    let (engine, _) = engine("payment_package.wal");
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.apply_payment(
                &admin(),
                PaymentNotice {
                    payment_id: "cs_pack10".into(),
                    user_id: "alice".into(),
                    product: PaymentProduct::Package {
                        credit_type: "standard".into(),
                        lessons: 10,
                    },
                },
            )
            .await
        }));
    }
    let mut applied = 0;
    for h in handles {
        if h.await.unwrap().unwrap() == PaymentOutcome::Applied {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    let credits = engine.credits(&alice(), "alice").await.unwrap();
    assert_eq!(credits.get("standard"), Some(&10));
    assert!(matches!(
        engine.credits(&Caller::user("bob"), "alice").await,
        Err(EngineError::Unauthorized(_))
    ));
}

// ── Availability & queries ───────────────────────────────

#[tokio::test]
async fn availability_view_reflects_calendar() {
    let (engine, _) = engine("availability.wal");
    let t = tutor(&engine).await;
    engine
        .reserve(&admin(), time_off(t, DAY + 9 * H, DAY + 12 * H))
        .await
        .unwrap();
    engine
        .reserve(&alice(), lesson(t, DAY + 14 * H, DAY + 15 * H))
        .await
        .unwrap();
    engine
        .reserve(&admin(), session(t, DAY + 15 * H, DAY + 16 * H, 4))
        .await
        .unwrap();
    let gone = engine
        .reserve(&alice(), lesson(t, DAY + 18 * H, DAY + 19 * H))
        .await
        .unwrap();
    engine.cancel(&alice(), gone, None).await.unwrap();

    let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let view = engine.availability_view(t, day, None).await.unwrap();
    assert_eq!(view.window, Span::new(DAY, DAY + 24 * H));
    assert_eq!(
        view.busy,
        vec![
            Span::new(DAY + 9 * H, DAY + 12 * H),
            Span::new(DAY + 14 * H, DAY + 16 * H),
        ]
    );
    assert_eq!(
        view.free,
        vec![
            Span::new(DAY, DAY + 9 * H),
            Span::new(DAY + 12 * H, DAY + 14 * H),
            Span::new(DAY + 16 * H, DAY + 24 * H),
        ]
    );

    let long = engine
        .availability_view(t, day, Some(3 * H))
        .await
        .unwrap();
    assert_eq!(long.free.len(), 2);
}

#[tokio::test]
async fn bookings_visible_to_owner_and_admin_only() {
    let (engine, _) = engine("visibility.wal");
    let t = tutor(&engine).await;
    let mine = engine
        .reserve(&alice(), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    let bob = Caller::user("bob");
    engine
        .reserve(&bob, lesson(t, DAY + 10 * H, DAY + 11 * H))
        .await
        .unwrap();

    assert_eq!(engine.bookings_for_tutor(&alice(), t).await.unwrap().len(), 1);
    assert_eq!(engine.bookings_for_tutor(&admin(), t).await.unwrap().len(), 2);
    assert_eq!(
        engine.get_booking(&bob, mine).await,
        Err(EngineError::NotFound(mine))
    );
    let alices = engine.bookings_for_user(&alice(), "alice").await.unwrap();
    assert_eq!(alices.len(), 1);
    assert_eq!(alices[0].id, mine);
    assert!(matches!(
        engine.bookings_for_user(&bob, "alice").await,
        Err(EngineError::Unauthorized(_))
    ));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_rebuilds_calendar_and_ledger() {
    let path = test_wal_path("replay_rebuild.wal");
    let clock = Arc::new(ManualClock::new(DAY - 16 * H));
    let (t, booking, sid) = {
        let engine = Engine::new(path.clone(), EngineSettings::default(), clock.clone()).unwrap();
        let t = tutor(&engine).await;
        let booking = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;
        let sid = engine
            .reserve(&admin(), session(t, DAY + 18 * H, DAY + 19 * H, 3))
            .await
            .unwrap();
        engine.register_participant(&alice(), sid, None).await.unwrap();
        let off = engine
            .reserve(&admin(), time_off(t, DAY + 12 * H, DAY + 13 * H))
            .await
            .unwrap();
        engine.cancel(&admin(), off, None).await.unwrap();
        engine
            .apply_payment(
                &admin(),
                PaymentNotice {
                    payment_id: "cs_1".into(),
                    user_id: "alice".into(),
                    product: PaymentProduct::Package {
                        credit_type: "standard".into(),
                        lessons: 5,
                    },
                },
            )
            .await
            .unwrap();
        (t, booking, sid)
    };

    let engine = Engine::new(path, EngineSettings::default(), clock).unwrap();
    assert_eq!(engine.list_tutors().await.len(), 1);
    assert_eq!(status_of(&engine, booking).await, BookingStatus::Confirmed);
    let sessions = engine.sessions_for_tutor(t).await.unwrap();
    assert_eq!(sessions[0].participants, vec!["alice".to_string()]);
    assert!(engine.time_off_for_tutor(t).await.unwrap().is_empty());
    assert_eq!(
        engine.credits(&alice(), "alice").await.unwrap().get("standard"),
        Some(&5)
    );

    // Indexes are rebuilt too: conflicts and record lookups still work.
    let clash = engine
        .reserve(&Caller::user("bob"), lesson(t, DAY + 9 * H, DAY + 10 * H))
        .await;
    assert_eq!(clash, Err(EngineError::SlotAlreadyBooked(booking)));
    engine
        .reschedule(&alice(), booking, DAY + 12 * H, DAY + 13 * H)
        .await
        .unwrap();
    // The replayed dedupe key still blocks a replayed payment.
    let again = engine
        .apply_payment(
            &admin(),
            PaymentNotice {
                payment_id: format!("pay-{booking}"),
                user_id: "alice".into(),
                product: PaymentProduct::Booking { booking_id: booking },
            },
        )
        .await;
    assert_eq!(again, Ok(PaymentOutcome::Duplicate));
    assert!(matches!(
        engine.reschedule(&admin(), sid, DAY + 20 * H, DAY + 21 * H).await,
        Ok(Record::GroupSession(_))
    ));
}

#[tokio::test]
async fn commits_after_torn_tail_survive_restart() {
    let path = test_wal_path("torn_tail_restart.wal");
    let clock = Arc::new(ManualClock::new(DAY - 16 * H));
    let t = {
        let engine = Engine::new(path.clone(), EngineSettings::default(), clock.clone()).unwrap();
        tutor(&engine).await
    };
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8; 6]).unwrap();
    }

    let booking = {
        let engine = Engine::new(path.clone(), EngineSettings::default(), clock.clone()).unwrap();
        engine
            .reserve(&alice(), lesson(t, DAY + 10 * H, DAY + 11 * H))
            .await
            .unwrap()
    };

    let engine = Engine::new(path.clone(), EngineSettings::default(), clock).unwrap();
    assert_eq!(status_of(&engine, booking).await, BookingStatus::AwaitingPayment);
    assert_eq!(crate::wal::Wal::replay(&path).unwrap().discarded_bytes, 0);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let clock = Arc::new(ManualClock::new(DAY - 16 * H));
    let (t, kept) = {
        let engine = Engine::new(path.clone(), EngineSettings::default(), clock.clone()).unwrap();
        let t = tutor(&engine).await;
        for i in 0..10 {
            let id = engine
                .reserve(&admin(), time_off(t, DAY + i * H, DAY + i * H + 30 * M))
                .await
                .unwrap();
            engine.cancel(&admin(), id, None).await.unwrap();
        }
        let kept = confirmed_booking(&engine, t, DAY + 9 * H, DAY + 10 * H).await;
        engine
            .apply_payment(
                &admin(),
                PaymentNotice {
                    payment_id: "cs_1".into(),
                    user_id: "alice".into(),
                    product: PaymentProduct::Package {
                        credit_type: "standard".into(),
                        lessons: 5,
                    },
                },
            )
            .await
            .unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 24);

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should shrink: {after} < {before}");

        // Writes after compaction land in the new file.
        engine
            .reserve(&admin(), time_off(t, DAY + 20 * H, DAY + 21 * H))
            .await
            .unwrap();
        (t, kept)
    };

    let engine = Engine::new(path, EngineSettings::default(), clock).unwrap();
    let b = engine.get_booking(&alice(), kept).await.unwrap();
    assert_eq!(b.status, BookingStatus::Confirmed);
    assert_eq!(b.status_history.len(), 2);
    assert_eq!(engine.time_off_for_tutor(t).await.unwrap().len(), 1);
    assert_eq!(
        engine.credits(&alice(), "alice").await.unwrap().get("standard"),
        Some(&5)
    );
    let replayed = engine
        .apply_payment(
            &admin(),
            PaymentNotice {
                payment_id: "cs_1".into(),
                user_id: "alice".into(),
                product: PaymentProduct::Package {
                    credit_type: "standard".into(),
                    lessons: 5,
                },
            },
        )
        .await;
    assert_eq!(replayed, Ok(PaymentOutcome::Duplicate));
}

#[tokio::test]
async fn group_commit_batches_concurrent_appends() {
    let path = test_wal_path("group_commit.wal");
    let clock = Arc::new(ManualClock::new(DAY));
    let engine = Arc::new(Engine::new(path.clone(), EngineSettings::default(), clock.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_tutor(
                &admin(),
                Tutor {
                    id: Ulid::new(),
                    name: format!("T{i}"),
                    utc_offset_minutes: 0,
                },
            )
            .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_tutors().await.len(), n);

    let engine2 = Engine::new(path, EngineSettings::default(), clock).unwrap();
    assert_eq!(engine2.list_tutors().await.len(), n);
}
