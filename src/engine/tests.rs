use super::*;
use crate::limits::*;
use crate::recurrence::{Frequency, RecurrenceRequest, TerminationMode};

use chrono::NaiveDate;
use tokio_test::{assert_err, assert_ok};

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn t(s: &str) -> Minute {
    parse_clock(s).unwrap()
}

fn admin() -> Actor {
    Actor::admin("admin")
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("reservas_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Fresh engine with one facility named "Escenario 01".
async fn setup(wal: &str) -> (Arc<Engine>, FacilityId) {
    let engine = Arc::new(Engine::new(test_wal_path(wal), RecurrencePolicy::default()).unwrap());
    let fid = engine.create_facility(&admin(), None, "Escenario 01").await.unwrap();
    (engine, fid)
}

fn request(facility_id: FacilityId, date: &str, start: &str, end: &str) -> BookingRequest {
    BookingRequest {
        facility_id: Some(facility_id),
        date: Some(d(date)),
        start_time: Some(t(start)),
        end_time: Some(t(end)),
        color: Some("azul".into()),
        recurrence: RecurrenceRequest::default(),
        requester: Requester {
            name: Some("Liga Municipal".into()),
            phone: Some("3001234567".into()),
            activity: Some("Entrenamiento".into()),
        },
    }
}

fn daily(mut req: BookingRequest, count: u32) -> BookingRequest {
    req.recurrence = RecurrenceRequest {
        frequency: Frequency::Daily,
        count: Some(count),
        ..Default::default()
    };
    req
}

async fn bookings_of(engine: &Engine, facility_id: FacilityId) -> Vec<Booking> {
    engine
        .list_bookings(&BookingFilter {
            facility_id: Some(facility_id),
            ..Default::default()
        })
        .await
        .into_iter()
        .map(|info| info.booking)
        .collect()
}

// ── Series insertion ─────────────────────────────────────

#[tokio::test]
async fn single_booking_is_created() {
    let (engine, fid) = setup("single.wal").await;
    let outcome = assert_ok!(engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "08:00", "09:00")).await);
    assert_eq!(outcome.created_count, 1);
    assert_eq!(outcome.dates, vec![d("2024-01-01")]);

    let info = engine.get_booking(outcome.ids[0]).await.unwrap();
    assert_eq!(info.facility_name, "Escenario 01");
    assert_eq!(info.booking.owner, "ana");
    assert_eq!(info.booking.time, TimeRange::new(480, 540).unwrap());
    assert_eq!(info.booking.requester.activity.as_deref(), Some("Entrenamiento"));
}

#[tokio::test]
async fn mon_wed_fri_series_creates_three() {
    let (engine, fid) = setup("mon_wed_fri.wal").await;
    let mut req = request(fid, "2024-01-01", "06:00", "08:00");
    req.recurrence = RecurrenceRequest {
        frequency: Frequency::Weekly,
        interval: Some(1),
        weekdays: vec![1, 3, 5],
        termination: Some(TerminationMode::ByCount),
        count: Some(3),
        end_date: None,
    };

    let outcome = engine.book(&Actor::user("ana"), req).await.unwrap();
    assert_eq!(outcome.created_count, 3);
    assert_eq!(outcome.dates, vec![d("2024-01-01"), d("2024-01-03"), d("2024-01-05")]);

    let dates: Vec<_> = bookings_of(&engine, fid).await.iter().map(|b| b.date).collect();
    assert_eq!(dates, outcome.dates);
}

#[tokio::test]
async fn by_end_date_series_stays_inside_bound() {
    let (engine, fid) = setup("end_date.wal").await;
    let mut req = request(fid, "2024-01-01", "06:00", "08:00");
    req.recurrence = RecurrenceRequest {
        frequency: Frequency::Daily,
        interval: Some(2),
        termination: Some(TerminationMode::ByEndDate),
        end_date: Some(d("2024-01-08")),
        ..Default::default()
    };
    let outcome = engine.book(&Actor::user("ana"), req).await.unwrap();
    assert_eq!(
        outcome.dates,
        vec![d("2024-01-01"), d("2024-01-03"), d("2024-01-05"), d("2024-01-07")]
    );
}

#[tokio::test]
async fn overlap_conflict_leaves_facility_unchanged() {
    let (engine, fid) = setup("overlap.wal").await;
    engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    let before = bookings_of(&engine, fid).await;

    let err = assert_err!(engine.book(&Actor::user("luis"), request(fid, "2024-01-01", "08:30", "09:30")).await);
    match err {
        EngineError::Conflict { date, existing } => {
            assert_eq!(date, d("2024-01-01"));
            assert_eq!(existing, before[0].id);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(bookings_of(&engine, fid).await, before);
}

#[tokio::test]
async fn adjacent_ranges_both_succeed() {
    let (engine, fid) = setup("adjacent.wal").await;
    assert_ok!(engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "09:00", "10:00")).await);
    assert_ok!(engine.book(&Actor::user("luis"), request(fid, "2024-01-01", "10:00", "11:00")).await);
    assert_eq!(bookings_of(&engine, fid).await.len(), 2);
}

#[tokio::test]
async fn same_slot_on_other_facility_or_date_is_free() {
    let (engine, fid) = setup("other_facility.wal").await;
    let other = engine.create_facility(&admin(), None, "Coliseo").await.unwrap();
    engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "09:00", "10:00")).await.unwrap();
    assert_ok!(engine.book(&Actor::user("ana"), request(other, "2024-01-01", "09:00", "10:00")).await);
    assert_ok!(engine.book(&Actor::user("ana"), request(fid, "2024-01-02", "09:00", "10:00")).await);
}

#[tokio::test]
async fn conflict_on_third_date_persists_nothing() {
    let (engine, fid) = setup("third_date.wal").await;
    let blocker = engine
        .book(&Actor::user("luis"), request(fid, "2024-01-03", "08:30", "09:30"))
        .await
        .unwrap();

    let err = engine
        .book(&Actor::user("ana"), daily(request(fid, "2024-01-01", "08:00", "09:00"), 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { date, .. } if date == d("2024-01-03")));
    assert_eq!(err.to_string(), format!("conflict on date 2024-01-03 (overlaps booking {})", blocker.ids[0]));

    let remaining = bookings_of(&engine, fid).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, blocker.ids[0]);
    for day in ["2024-01-01", "2024-01-02", "2024-01-04", "2024-01-05"] {
        assert_eq!(engine.free_slots(fid, d(day), None).await.unwrap(), vec![TimeRange::whole_day()]);
    }
}

#[tokio::test]
async fn first_conflicting_date_is_reported() {
    let (engine, fid) = setup("first_conflict.wal").await;
    for day in ["2024-01-04", "2024-01-02"] {
        engine.book(&Actor::user("luis"), request(fid, day, "08:00", "09:00")).await.unwrap();
    }
    let err = engine
        .book(&Actor::user("ana"), daily(request(fid, "2024-01-01", "08:00", "09:00"), 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { date, .. } if date == d("2024-01-02")));
}

#[tokio::test]
async fn duplicate_dates_collapse_to_one_booking() {
    let (engine, fid) = setup("intra_series.wal").await;
    let draft = BookingDraft {
        facility_id: fid,
        time: TimeRange::new(t("08:00"), t("09:00")).unwrap(),
        color: "rojo".into(),
        requester: Requester::default(),
    };
    let ids = engine
        .create_booking_series("ana", &draft, &[d("2024-02-01"), d("2024-02-01")])
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn validation_happens_before_storage() {
    let (engine, fid) = setup("validation.wal").await;
    let ana = Actor::user("ana");

    let mut missing_color = request(fid, "2024-01-01", "08:00", "09:00");
    missing_color.color = None;
    assert!(matches!(engine.book(&ana, missing_color).await, Err(EngineError::Validation(_))));

    let reversed = request(fid, "2024-01-01", "10:00", "09:00");
    assert!(matches!(engine.book(&ana, reversed).await, Err(EngineError::Validation(_))));

    let empty = request(fid, "2024-01-01", "09:00", "09:00");
    assert!(matches!(engine.book(&ana, empty).await, Err(EngineError::Validation(_))));

    let mut no_date = request(fid, "2024-01-01", "08:00", "09:00");
    no_date.date = None;
    assert!(matches!(engine.book(&ana, no_date).await, Err(EngineError::Validation(_))));

    let mut zero_interval = daily(request(fid, "2024-01-01", "08:00", "09:00"), 3);
    zero_interval.recurrence.interval = Some(0);
    assert!(matches!(engine.book(&ana, zero_interval).await, Err(EngineError::Validation(_))));

    let mut missing_end = request(fid, "2024-01-01", "08:00", "09:00");
    missing_end.recurrence.frequency = Frequency::Daily;
    missing_end.recurrence.termination = Some(TerminationMode::ByEndDate);
    assert!(matches!(engine.book(&ana, missing_end).await, Err(EngineError::Validation(_))));

    let mut long_phone = request(fid, "2024-01-01", "08:00", "09:00");
    long_phone.requester.phone = Some("9".repeat(MAX_REQUESTER_PHONE_LEN + 1));
    assert!(matches!(engine.book(&ana, long_phone).await, Err(EngineError::LimitExceeded(_))));

    assert!(bookings_of(&engine, fid).await.is_empty());
    assert_eq!(engine.wal_appends_since_compact().await, 1); // only the facility
}

#[tokio::test]
async fn unknown_facility_is_rejected() {
    let (engine, _) = setup("unknown_facility.wal").await;
    let result = engine.book(&Actor::user("ana"), request(99, "2024-01-01", "08:00", "09:00")).await;
    assert!(matches!(result, Err(EngineError::FacilityNotFound(99))));
}

#[tokio::test]
async fn concurrent_same_slot_only_one_wins() {
    let (engine, fid) = setup("race.wal").await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let req = daily(request(fid, "2024-05-06", "18:00", "20:00"), 3);
            engine.book(&Actor::user(format!("user{i}")), req).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.created_count, 3);
                wins += 1;
            }
            Err(EngineError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(bookings_of(&engine, fid).await.len(), 3);
}

// ── Update / delete ──────────────────────────────────────

#[tokio::test]
async fn update_ignores_its_own_range() {
    let (engine, fid) = setup("update_self.wal").await;
    let ana = Actor::user("ana");
    let created = engine.book(&ana, request(fid, "2024-01-01", "08:00", "10:00")).await.unwrap();

    let patch = BookingPatch {
        start_time: Some(t("09:00")),
        end_time: Some(t("11:00")),
        color: Some("verde".into()),
        ..Default::default()
    };
    let updated = engine.update_booking(&ana, created.ids[0], patch).await.unwrap();
    assert_eq!(updated.time, TimeRange::new(t("09:00"), t("11:00")).unwrap());
    assert_eq!(updated.color, "verde");
    assert_eq!(updated.requester.name.as_deref(), Some("Liga Municipal"));
}

#[tokio::test]
async fn update_into_other_booking_conflicts() {
    let (engine, fid) = setup("update_conflict.wal").await;
    let ana = Actor::user("ana");
    let first = engine.book(&ana, request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    engine.book(&ana, request(fid, "2024-01-01", "10:00", "11:00")).await.unwrap();

    let patch = BookingPatch {
        end_time: Some(t("10:30")),
        ..Default::default()
    };
    let result = engine.update_booking(&ana, first.ids[0], patch).await;
    assert!(matches!(result, Err(EngineError::Conflict { .. })));

    let unchanged = engine.get_booking(first.ids[0]).await.unwrap();
    assert_eq!(unchanged.booking.time.end, t("09:00"));
}

#[tokio::test]
async fn update_can_clear_requester_fields() {
    let (engine, fid) = setup("update_clear.wal").await;
    let ana = Actor::user("ana");
    let created = engine.book(&ana, request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    let patch = BookingPatch {
        requester_phone: Some(None),
        ..Default::default()
    };
    let updated = engine.update_booking(&ana, created.ids[0], patch).await.unwrap();
    assert_eq!(updated.requester.phone, None);
    assert_eq!(updated.requester.name.as_deref(), Some("Liga Municipal"));
}

#[tokio::test]
async fn update_moves_booking_between_facilities() {
    let (engine, fid) = setup("update_move.wal").await;
    let coliseo = engine.create_facility(&admin(), None, "Coliseo").await.unwrap();
    let ana = Actor::user("ana");
    let created = engine.book(&ana, request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    let id = created.ids[0];

    let patch = BookingPatch {
        facility_id: Some(coliseo),
        date: Some(d("2024-01-02")),
        ..Default::default()
    };
    engine.update_booking(&ana, id, patch).await.unwrap();

    assert!(bookings_of(&engine, fid).await.is_empty());
    let moved = bookings_of(&engine, coliseo).await;
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].id, id);
    assert_eq!(moved[0].date, d("2024-01-02"));
    assert_eq!(
        engine.locate(&id),
        Some(BookingLocation { facility_id: coliseo, date: d("2024-01-02") })
    );

    // Moving onto an occupied slot is a conflict.
    let other = engine.book(&ana, request(fid, "2024-01-02", "08:30", "09:30")).await.unwrap();
    let back = BookingPatch {
        facility_id: Some(coliseo),
        ..Default::default()
    };
    let result = engine.update_booking(&ana, other.ids[0], back).await;
    assert!(matches!(result, Err(EngineError::Conflict { existing, .. }) if existing == id));
}

#[tokio::test]
async fn only_owner_or_admin_may_modify() {
    let (engine, fid) = setup("auth.wal").await;
    let created = engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    let id = created.ids[0];
    engine.book(&Actor::user("luis"), request(fid, "2024-01-01", "09:00", "10:00")).await.unwrap();

    // Rejected before the conflict check: this patch would also overlap.
    let patch = BookingPatch {
        end_time: Some(t("09:30")),
        ..Default::default()
    };
    let result = engine.update_booking(&Actor::user("luis"), id, patch).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));
    let result = engine.cancel_booking(&Actor::user("luis"), id).await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));

    let patch = BookingPatch {
        color: Some("negro".into()),
        ..Default::default()
    };
    assert_ok!(engine.update_booking(&admin(), id, patch).await);
    assert_ok!(engine.cancel_booking(&admin(), id).await);
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let (engine, fid) = setup("cancel.wal").await;
    let ana = Actor::user("ana");
    let created = engine.book(&ana, request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    let id = created.ids[0];

    let removed = engine.cancel_booking(&ana, id).await.unwrap();
    assert_eq!(removed.id, id);
    assert!(engine.locate(&id).is_none());
    assert!(matches!(engine.get_booking(id).await, Err(EngineError::BookingNotFound(_))));
    assert!(matches!(engine.cancel_booking(&ana, id).await, Err(EngineError::BookingNotFound(_))));

    assert_ok!(engine.book(&Actor::user("luis"), request(fid, "2024-01-01", "08:00", "09:00")).await);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_bookings_filters_and_orders() {
    let (engine, fid) = setup("list.wal").await;
    let coliseo = engine.create_facility(&admin(), None, "Coliseo").await.unwrap();
    engine.book(&Actor::user("ana"), request(fid, "2024-01-02", "10:00", "11:00")).await.unwrap();
    engine.book(&Actor::user("luis"), request(coliseo, "2024-01-02", "08:00", "09:00")).await.unwrap();
    engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "12:00", "13:00")).await.unwrap();
    engine.book(&Actor::user("ana"), request(fid, "2024-01-05", "12:00", "13:00")).await.unwrap();

    let all = engine.list_bookings(&BookingFilter::default()).await;
    let order: Vec<_> = all.iter().map(|i| (i.booking.date, i.booking.time.start)).collect();
    assert_eq!(
        order,
        vec![
            (d("2024-01-01"), t("12:00")),
            (d("2024-01-02"), t("08:00")),
            (d("2024-01-02"), t("10:00")),
            (d("2024-01-05"), t("12:00")),
        ]
    );
    assert_eq!(all[1].facility_name, "Coliseo");

    let filtered = engine
        .list_bookings(&BookingFilter {
            facility_id: None,
            from: Some(d("2024-01-02")),
            to: Some(d("2024-01-04")),
            owner: Some("ana".into()),
        })
        .await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].booking.date, d("2024-01-02"));
    assert_eq!(filtered[0].booking.facility_id, fid);

    let missing = engine
        .list_bookings(&BookingFilter {
            facility_id: Some(404),
            ..Default::default()
        })
        .await;
    assert!(missing.is_empty());
}

#[tokio::test]
async fn free_slots_reflect_bookings() {
    let (engine, fid) = setup("free_slots.wal").await;
    engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "12:00", "14:00")).await.unwrap();

    let window = TimeRange::new(t("06:00"), t("22:00"));
    let free = engine.free_slots(fid, d("2024-01-01"), window).await.unwrap();
    assert_eq!(
        free,
        vec![
            TimeRange::new(t("06:00"), t("08:00")).unwrap(),
            TimeRange::new(t("09:00"), t("12:00")).unwrap(),
            TimeRange::new(t("14:00"), t("22:00")).unwrap(),
        ]
    );
    assert!(matches!(
        engine.free_slots(404, d("2024-01-01"), None).await,
        Err(EngineError::FacilityNotFound(404))
    ));
}

// ── Facility roster ──────────────────────────────────────

#[tokio::test]
async fn facility_roster_lifecycle() {
    let path = test_wal_path("roster.wal");
    let engine = Engine::new(path, RecurrencePolicy::default()).unwrap();
    let root = admin();

    let pool = engine.create_facility(&root, Some(10), "Piscina").await.unwrap();
    assert_eq!(pool, 10);
    let next = engine.create_facility(&root, None, "  Cancha Sintética ").await.unwrap();
    assert_eq!(next, 11);
    let court = engine.create_facility(&root, None, "Cancha 1").await.unwrap();
    assert_eq!(court, 12);

    assert!(matches!(
        engine.create_facility(&root, Some(10), "Otra").await,
        Err(EngineError::FacilityExists(10))
    ));
    assert!(matches!(
        engine.create_facility(&root, None, "piscina").await,
        Err(EngineError::DuplicateName(_))
    ));
    assert!(matches!(
        engine.create_facility(&root, None, "   ").await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.create_facility(&root, Some(0), "Cero").await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.create_facility(&Actor::user("ana"), None, "Gimnasio").await,
        Err(EngineError::Unauthorized(_))
    ));

    let names: Vec<_> = engine.list_facilities().await.into_iter().map(|f| f.name).collect();
    assert_eq!(names, vec!["Cancha 1", "Cancha Sintética", "Piscina"]);

    assert!(matches!(
        engine.rename_facility(&root, court, "PISCINA").await,
        Err(EngineError::DuplicateName(_))
    ));
    engine.rename_facility(&root, pool, "piscina olímpica").await.unwrap();
    // Renaming to a different casing of its own name is fine.
    engine.rename_facility(&root, pool, "Piscina Olímpica").await.unwrap();
    // The old name is free again.
    assert_ok!(engine.create_facility(&root, None, "Piscina").await);

    engine.delete_facility(&root, court).await.unwrap();
    assert!(engine.get_facility(&court).is_none());
    assert!(matches!(
        engine.delete_facility(&root, court).await,
        Err(EngineError::FacilityNotFound(_))
    ));
    assert_ok!(engine.create_facility(&root, None, "Cancha 1").await);
}

#[tokio::test]
async fn facility_with_bookings_cannot_be_deleted() {
    let (engine, fid) = setup("delete_busy.wal").await;
    let created = engine.book(&Actor::user("ana"), request(fid, "2024-01-01", "08:00", "09:00")).await.unwrap();
    assert!(matches!(
        engine.delete_facility(&admin(), fid).await,
        Err(EngineError::HasBookings(_))
    ));
    engine.cancel_booking(&Actor::user("ana"), created.ids[0]).await.unwrap();
    assert_ok!(engine.delete_facility(&admin(), fid).await);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (series_ids, moved_id, cancelled_id, coliseo) = {
        let engine = Engine::new(path.clone(), RecurrencePolicy::default()).unwrap();
        let fid = engine.create_facility(&admin(), Some(1), "Escenario 01").await.unwrap();
        let coliseo = engine.create_facility(&admin(), Some(2), "Coliseo").await.unwrap();
        let ana = Actor::user("ana");
        let series = engine.book(&ana, daily(request(fid, "2024-03-04", "07:00", "08:00"), 4)).await.unwrap();
        let single = engine.book(&ana, request(fid, "2024-03-10", "07:00", "08:00")).await.unwrap();
        let moved = series.ids[1];
        let patch = BookingPatch {
            facility_id: Some(coliseo),
            ..Default::default()
        };
        engine.update_booking(&ana, moved, patch).await.unwrap();
        engine.cancel_booking(&ana, single.ids[0]).await.unwrap();
        engine.rename_facility(&admin(), fid, "Escenario Uno").await.unwrap();
        (series.ids, moved, single.ids[0], coliseo)
    };

    let engine = Engine::new(path, RecurrencePolicy::default()).unwrap();
    let facilities = engine.list_facilities().await;
    assert_eq!(
        facilities,
        vec![
            FacilityInfo { id: 2, name: "Coliseo".into(), booking_count: 1 },
            FacilityInfo { id: 1, name: "Escenario Uno".into(), booking_count: 3 },
        ]
    );
    assert!(engine.locate(&cancelled_id).is_none());
    assert_eq!(engine.locate(&moved_id).map(|l| l.facility_id), Some(coliseo));
    for id in &series_ids {
        assert!(engine.get_booking(*id).await.is_ok());
    }
    // Names are still unique after replay.
    assert!(matches!(
        engine.create_facility(&admin(), None, "escenario uno").await,
        Err(EngineError::DuplicateName(_))
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let kept = {
        let engine = Engine::new(path.clone(), RecurrencePolicy::default()).unwrap();
        let fid = engine.create_facility(&admin(), None, "Escenario 01").await.unwrap();
        let ana = Actor::user("ana");
        for day in 1..=9 {
            let created = engine
                .book(&ana, request(fid, &format!("2024-04-0{day}"), "10:00", "11:00"))
                .await
                .unwrap();
            if day % 3 != 0 {
                engine.cancel_booking(&ana, created.ids[0]).await.unwrap();
            }
        }
        let before = std::fs::metadata(&path).unwrap().len();
        assert_eq!(engine.wal_appends_since_compact().await, 16);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);

        // Appends after compaction land in the new file.
        engine.book(&ana, request(fid, "2024-05-01", "10:00", "11:00")).await.unwrap();
        bookings_of(&engine, fid).await
    };
    assert_eq!(kept.len(), 4);

    let engine = Engine::new(path, RecurrencePolicy::default()).unwrap();
    let replayed = bookings_of(&engine, kept[0].facility_id).await;
    assert_eq!(replayed, kept);
}

#[tokio::test]
async fn waiting_writer_sees_deleted_facility() {
    let (engine, fid) = setup("deleted_while_waiting.wal").await;
    let guard = engine.lock_facility(fid).await.unwrap();

    let waiting = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .book(&Actor::user("ana"), request(fid, "2024-01-01", "08:00", "09:00"))
                .await
        })
    };
    tokio::task::yield_now().await;
    // Simulate the delete path having won the race.
    engine.facilities.remove(&fid);
    drop(guard);

    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(EngineError::FacilityNotFound(_))));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn storage_failure_rejects_series_without_rows() {
    // Every flush to /dev/full fails with ENOSPC.
    let wal = Wal::open(std::path::Path::new("/dev/full")).unwrap();
    let replayed = vec![Event::FacilityCreated { id: 1, name: "Escenario 01".into() }];
    let engine = Engine::from_wal(wal, replayed, RecurrencePolicy::default());

    let result = engine
        .book(&Actor::user("ana"), daily(request(1, "2024-01-01", "08:00", "09:00"), 3))
        .await;
    assert!(matches!(result, Err(EngineError::WalError(_))), "got {result:?}");
    assert!(bookings_of(&engine, 1).await.is_empty());
    assert!(engine.list_bookings(&BookingFilter::default()).await.is_empty());
    assert_eq!(
        engine.free_slots(1, d("2024-01-02"), None).await.unwrap(),
        vec![TimeRange::whole_day()]
    );
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    let created = engine.create_facility(&admin(), None, "Coliseo").await;
    assert!(matches!(created, Err(EngineError::WalError(_))));
    assert_eq!(engine.list_facilities().await.len(), 1);
}
