use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use super::*;
use crate::calendar::{self, Clock};
use crate::limits::*;
use crate::notify::{NoticeKind, NotifyError, NotifyHub};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bookd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn at(ts: &str) -> Ms {
    calendar::parse_timestamp(ts).unwrap()
}

/// Records every notice; optionally fails each delivery.
#[derive(Default)]
struct Recorder {
    fail: bool,
    sent: StdMutex<Vec<(Ulid, Notice)>>,
}

impl Notifier for Recorder {
    fn notify(&self, user_id: Ulid, notice: &Notice) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((user_id, notice.clone()));
        if self.fail {
            return Err(NotifyError::Unavailable("smtp relay down".into()));
        }
        Ok(())
    }
}

impl Recorder {
    fn kinds(&self) -> Vec<NoticeKind> {
        self.sent.lock().unwrap().iter().map(|(_, n)| n.kind).collect()
    }
}

struct Fixture {
    engine: Engine,
    notices: Arc<Recorder>,
    alice: Ulid,
    bob: Ulid,
    admin: Ulid,
    /// Capacity 10, active.
    hall: Ulid,
}

async fn open(path: PathBuf, notices: Arc<Recorder>) -> Engine {
    Engine::new(path, notices)
        .unwrap()
        .with_clock(Clock::Fixed(at("2025-03-01 08:00")))
}

async fn fixture(name: &str) -> Fixture {
    fixture_with(name, Recorder::default()).await
}

async fn fixture_with(name: &str, recorder: Recorder) -> Fixture {
    let notices = Arc::new(recorder);
    let engine = open(test_wal_path(name), notices.clone()).await;
    let alice = Ulid::new();
    let bob = Ulid::new();
    let admin = Ulid::new();
    engine.register_user(alice, "Alice", Role::Member).await.unwrap();
    engine.register_user(bob, "Bob", Role::Member).await.unwrap();
    engine.register_user(admin, "Dana", Role::Admin).await.unwrap();
    let hall = Ulid::new();
    engine
        .create_facility(hall, "Main Hall", Some(10), true)
        .await
        .unwrap();
    Fixture {
        engine,
        notices,
        alice,
        bob,
        admin,
        hall,
    }
}

fn booking(facility: Ulid, date: &str, start: &str, end: &str, attendees: u32) -> NewReservation {
    NewReservation {
        id: None,
        facility_id: Some(facility),
        date: date.into(),
        start_time: start.into(),
        end_time: end.into(),
        purpose: "Team planning".into(),
        attendees,
        proposal_ref: None,
    }
}

// ── Booking scenarios ────────────────────────────────────

#[tokio::test]
async fn create_on_free_facility_is_pending() {
    let f = fixture("create_pending.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    assert_eq!(d.status, ReservationStatus::Pending);
    assert_eq!(d.date, "2025-03-01");
    assert_eq!(d.start_time, "10:00");
    assert_eq!(d.end_time, "11:00");
    assert_eq!(d.requester_name.as_deref(), Some("Alice"));
    assert_eq!(d.facility_name.as_deref(), Some("Main Hall"));
    assert_eq!(d.facility_capacity, Some(10));
    assert_eq!(f.notices.kinds(), vec![NoticeKind::Submitted]);
}

#[tokio::test]
async fn overlapping_request_conflicts() {
    let f = fixture("overlap_conflict.wal").await;
    let first = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    let err = f
        .engine
        .create_reservation(f.bob, booking(f.hall, "2025-03-01", "10:30", "11:30", 3))
        .await
        .unwrap_err();
    match err {
        EngineError::SlotConflict {
            facility_id,
            conflicting,
        } => {
            assert_eq!(facility_id, f.hall);
            assert_eq!(conflicting.len(), 1);
        }
        other => panic!("expected SlotConflict, got {other:?}"),
    }
    assert_eq!(f.engine.list_all_reservations().await.len(), 1);
    assert_eq!(f.engine.list_all_reservations().await[0].id, first.id);
}

#[tokio::test]
async fn back_to_back_does_not_conflict() {
    let f = fixture("back_to_back.wal").await;
    f.engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine
        .create_reservation(f.bob, booking(f.hall, "2025-03-01", "11:00", "12:00", 3))
        .await
        .unwrap();
    f.engine
        .create_reservation(f.bob, booking(f.hall, "2025-03-01", "09:00", "10:00", 3))
        .await
        .unwrap();
    assert_eq!(
        f.engine.busy_slots(f.hall, "2025-03-01").await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn capacity_edit_rejected_and_state_unchanged() {
    let f = fixture("capacity_edit.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    let err = f
        .engine
        .update_reservation(
            d.id,
            f.alice,
            ReservationPatch {
                attendees: Some(15),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CapacityExceeded {
            capacity: 10,
            requested: 15
        }
    ));
    let after = f.engine.get_reservation(d.id, Some(f.alice)).await.unwrap();
    assert_eq!(after.attendees, 5);
    assert_eq!(after.updated_at, d.updated_at);
}

#[tokio::test]
async fn create_over_capacity_rejected() {
    let f = fixture("capacity_create.wal").await;
    let err = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 11))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { .. }));
}

#[tokio::test]
async fn maintenance_blocks_new_bookings() {
    let f = fixture("maintenance.wal").await;
    f.engine
        .update_facility(
            f.hall,
            FacilityPatch {
                maintenance_until: Some(Some("2025-04-01".into())),
                maintenance_reason: Some(Some("floor refinishing".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-15", "10:00", "11:00", 5))
        .await
        .unwrap_err();
    let msg = match err {
        EngineError::FacilityUnavailable(msg) => msg,
        other => panic!("expected FacilityUnavailable, got {other:?}"),
    };
    assert!(msg.contains("2025-04-01"), "{msg}");
    assert!(msg.contains("floor refinishing"), "{msg}");

    // Clearing the window makes the facility bookable again.
    f.engine
        .update_facility(
            f.hall,
            FacilityPatch {
                maintenance_until: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let info = f.engine.get_facility(f.hall).await.unwrap();
    assert!(!info.under_maintenance);
    assert_eq!(info.maintenance_reason, None);
    f.engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-15", "10:00", "11:00", 5))
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_maintenance_does_not_block() {
    let f = fixture("maintenance_expired.wal").await;
    f.engine
        .update_facility(
            f.hall,
            FacilityPatch {
                maintenance_until: Some(Some("2025-02-01".into())),
                maintenance_reason: Some(Some("painting".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    f.engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-15", "10:00", "11:00", 5))
        .await
        .unwrap();
}

#[tokio::test]
async fn inactive_facility_is_unavailable() {
    let f = fixture("inactive.wal").await;
    f.engine
        .update_facility(
            f.hall,
            FacilityPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::FacilityUnavailable(_)));
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let f = fixture("cancel_frees.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine.cancel_reservation(d.id, f.alice).await.unwrap();
    let after = f.engine.get_reservation(d.id, None).await.unwrap();
    assert_eq!(after.status, ReservationStatus::Canceled);

    f.engine
        .create_reservation(f.bob, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    assert_eq!(
        f.notices.kinds(),
        vec![
            NoticeKind::Submitted,
            NoticeKind::Canceled,
            NoticeKind::Submitted
        ]
    );
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn edit_only_while_pending() {
    let f = fixture("edit_pending.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine
        .set_reservation_status(d.id, "approved", Some(f.admin), None)
        .await
        .unwrap();
    let err = f
        .engine
        .update_reservation(
            d.id,
            f.alice,
            ReservationPatch {
                purpose: Some("Different purpose".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    let after = f.engine.get_reservation(d.id, None).await.unwrap();
    assert_eq!(after.purpose, "Team planning");
}

#[tokio::test]
async fn edit_excludes_own_item_from_conflicts() {
    let f = fixture("self_exclusion.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    let moved = f
        .engine
        .update_reservation(
            d.id,
            f.alice,
            ReservationPatch {
                start_time: Some("10:30".into()),
                end_time: Some("11:30".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.start_time, "10:30");
    assert_eq!(moved.end_time, "11:30");

    // The old window is free again, the new one is taken.
    assert!(f
        .engine
        .check_facility_availability(f.hall, "2025-03-01", "10:00", "10:30")
        .await
        .unwrap());
    assert!(!f
        .engine
        .check_facility_availability(f.hall, "2025-03-01", "11:00", "12:00")
        .await
        .unwrap());
}

#[tokio::test]
async fn edit_into_someone_elses_window_conflicts() {
    let f = fixture("edit_conflict.wal").await;
    let mine = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine
        .create_reservation(f.bob, booking(f.hall, "2025-03-01", "13:00", "14:00", 5))
        .await
        .unwrap();
    let err = f
        .engine
        .update_reservation(
            mine.id,
            f.alice,
            ReservationPatch {
                start_time: Some("12:30".into()),
                end_time: Some("13:30".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));
    let after = f.engine.get_reservation(mine.id, None).await.unwrap();
    assert_eq!(after.start_time, "10:00");
}

#[tokio::test]
async fn edit_by_stranger_forbidden() {
    let f = fixture("edit_forbidden.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    let err = f
        .engine
        .update_reservation(
            d.id,
            f.bob,
            ReservationPatch {
                attendees: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = f.engine.cancel_reservation(d.id, f.bob).await.unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
}

#[tokio::test]
async fn terminal_states_are_final() {
    let f = fixture("terminal_final.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine
        .set_reservation_status(d.id, "REJECTED", Some(f.admin), Some("double event".into()))
        .await
        .unwrap();

    for status in ["APPROVED", "PENDING", "CANCELED"] {
        let err = f
            .engine
            .set_reservation_status(d.id, status, Some(f.admin), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }), "{status}");
    }
    let err = f.engine.cancel_reservation(d.id, f.alice).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    // Rejected reservations no longer occupy the schedule.
    assert!(f
        .engine
        .check_facility_availability(f.hall, "2025-03-01", "10:00", "11:00")
        .await
        .unwrap());
}

#[tokio::test]
async fn cancel_twice_is_invalid_state() {
    let f = fixture("cancel_twice.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine.cancel_reservation(d.id, f.alice).await.unwrap();
    let err = f.engine.cancel_reservation(d.id, f.alice).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: ReservationStatus::Canceled,
            ..
        }
    ));
}

#[tokio::test]
async fn owner_may_cancel_approved() {
    let f = fixture("cancel_approved.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine
        .set_reservation_status(d.id, "approved", Some(f.admin), None)
        .await
        .unwrap();
    f.engine.cancel_reservation(d.id, f.alice).await.unwrap();
    let log = f.engine.approval_log(d.id, Some(f.alice)).unwrap();
    let actions: Vec<LogAction> = log.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![LogAction::Submitted, LogAction::Approved, LogAction::Canceled]
    );
    assert_eq!(log[1].actor, Some(f.admin));
    assert_eq!(log[2].actor, Some(f.alice));
}

#[tokio::test]
async fn unknown_status_rejected() {
    let f = fixture("unknown_status.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    for bad in ["ongoing", "completed", "approve", ""] {
        let err = f
            .engine
            .set_reservation_status(d.id, bad, Some(f.admin), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStatus(_)), "{bad}");
    }
    let ok = f
        .engine
        .set_reservation_status(d.id, "Cancelled", Some(f.admin), None)
        .await
        .unwrap();
    assert_eq!(ok.status, ReservationStatus::Canceled);
}

#[tokio::test]
async fn status_change_requires_admin() {
    let f = fixture("status_admin.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    let err = f
        .engine
        .set_reservation_status(d.id, "APPROVED", Some(f.bob), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));
    let err = f
        .engine
        .set_reservation_status(d.id, "APPROVED", Some(Ulid::new()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::User, _)));
}

#[tokio::test]
async fn status_change_notifies_requester() {
    let f = fixture("status_notify.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine
        .set_reservation_status(d.id, "APPROVED", Some(f.admin), None)
        .await
        .unwrap();
    let sent = f.notices.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].0, f.alice);
    assert_eq!(sent[1].1.status, ReservationStatus::Approved);
}

// ── Create validation ────────────────────────────────────

#[tokio::test]
async fn create_resolution_order() {
    let f = fixture("resolution_order.wal").await;
    let err = f
        .engine
        .create_reservation(Ulid::new(), booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::User, _)));

    let err = f
        .engine
        .create_reservation(f.alice, booking(Ulid::new(), "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(Entity::Facility, _)));
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let f = fixture("bad_input.wal").await;
    let cases = [
        booking(f.hall, "2025-03-01", "11:00", "10:00", 5),
        booking(f.hall, "2025-03-01", "10:00", "10:00", 5),
        booking(f.hall, "03/01/2025", "10:00", "11:00", 5),
        booking(f.hall, "2025-03-01", "10am", "11:00", 5),
    ];
    for input in cases {
        let err = f.engine.create_reservation(f.alice, input).await.unwrap_err();
        assert!(matches!(err, EngineError::Time(_)), "{err:?}");
    }

    let mut short = booking(f.hall, "2025-03-01", "10:00", "11:00", 5);
    short.purpose = "Mtg".into();
    assert!(matches!(
        f.engine.create_reservation(f.alice, short).await,
        Err(EngineError::Validation(_))
    ));
    let zero = booking(f.hall, "2025-03-01", "10:00", "11:00", 0);
    assert!(matches!(
        f.engine.create_reservation(f.alice, zero).await,
        Err(EngineError::Validation(_))
    ));
    let mut long = booking(f.hall, "2025-03-01", "10:00", "11:00", 5);
    long.purpose = "x".repeat(MAX_PURPOSE_LEN + 1);
    assert!(matches!(
        f.engine.create_reservation(f.alice, long).await,
        Err(EngineError::Validation(_))
    ));
    assert!(f.engine.list_all_reservations().await.is_empty());
}

#[tokio::test]
async fn create_with_known_id_is_not_repeated() {
    let f = fixture("known_id.wal").await;
    let id = Ulid::new();
    let mut input = booking(f.hall, "2025-03-01", "10:00", "11:00", 5);
    input.id = Some(id);
    let d = f.engine.create_reservation(f.alice, input.clone()).await.unwrap();
    assert_eq!(d.id, id);
    let err = f.engine.create_reservation(f.alice, input).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(Entity::Reservation, _)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_id_racing_across_facilities_is_created_once() {
    let f = fixture("known_id_race.wal").await;
    let annex = Ulid::new();
    f.engine
        .create_facility(annex, "Annex", Some(10), true)
        .await
        .unwrap();
    let (alice, hall) = (f.alice, f.hall);
    let engine = Arc::new(f.engine);

    for round in 0..20 {
        let id = Ulid::new();
        let start = format!("{:02}:00", round);
        let end = format!("{:02}:30", round);
        let mut in_hall = booking(hall, "2025-03-02", &start, &end, 2);
        in_hall.id = Some(id);
        let mut in_annex = booking(annex, "2025-03-02", &start, &end, 2);
        in_annex.id = Some(id);
        let mut unbound = in_hall.clone();
        unbound.facility_id = None;

        let (a, b, c) = tokio::join!(
            tokio::spawn({
                let engine = engine.clone();
                async move { engine.create_reservation(alice, in_hall).await }
            }),
            tokio::spawn({
                let engine = engine.clone();
                async move { engine.create_reservation(alice, in_annex).await }
            }),
            tokio::spawn({
                let engine = engine.clone();
                async move { engine.create_reservation(alice, unbound).await }
            }),
        );
        let results = [a.unwrap(), b.unwrap(), c.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "round {round}: {results:?}");
        for r in &results {
            if let Err(e) = r {
                assert!(matches!(e, EngineError::AlreadyExists(Entity::Reservation, _)), "{e:?}");
            }
        }
    }

    let hall_busy = engine.busy_slots(hall, "2025-03-02").await.unwrap();
    let annex_busy = engine.busy_slots(annex, "2025-03-02").await.unwrap();
    let owned = engine.list_reservations_for_user(alice).await;
    assert_eq!(owned.len(), 20);
    let bound = owned.iter().filter(|r| r.facility_id.is_some()).count();
    assert_eq!(hall_busy.len() + annex_busy.len(), bound);
}

#[tokio::test]
async fn unbound_reservations_skip_facility_checks() {
    let f = fixture("unbound.wal").await;
    let mut input = booking(f.hall, "2025-03-01", "10:00", "11:00", 500);
    input.facility_id = None;
    let a = f.engine.create_reservation(f.alice, input.clone()).await.unwrap();
    let b = f.engine.create_reservation(f.bob, input).await.unwrap();
    assert_eq!(a.facility_id, None);
    assert_eq!(a.facility_name, None);
    assert_ne!(a.id, b.id);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn get_reservation_hides_from_strangers() {
    let f = fixture("visibility.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    assert!(f.engine.get_reservation(d.id, Some(f.alice)).await.is_ok());
    assert!(f.engine.get_reservation(d.id, Some(f.admin)).await.is_ok());
    assert!(matches!(
        f.engine.get_reservation(d.id, Some(f.bob)).await,
        Err(EngineError::NotFound(Entity::Reservation, _))
    ));
    assert!(f.engine.approval_log(d.id, Some(f.bob)).is_err());
}

#[tokio::test]
async fn reads_are_idempotent() {
    let f = fixture("idempotent_read.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    let a = f.engine.get_reservation(d.id, None).await.unwrap();
    let b = f.engine.get_reservation(d.id, None).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a, d);
}

#[tokio::test]
async fn listings_are_newest_first() {
    let f = fixture("listings.wal").await;
    let mut ids = Vec::new();
    // Same clock tick for every create, so ids break the tie.
    for (i, start) in ["08:00", "09:00", "10:00"].iter().enumerate() {
        let end = format!("{:02}:30", 8 + i);
        let mut input = booking(f.hall, "2025-03-01", start, &end, 2);
        input.id = Some(Ulid::from_parts(1_000 + i as u64, 0));
        let d = f.engine.create_reservation(f.alice, input).await.unwrap();
        ids.push(d.id);
    }
    f.engine
        .create_reservation(f.bob, booking(f.hall, "2025-03-02", "08:00", "09:00", 2))
        .await
        .unwrap();

    let mine: Vec<Ulid> = f
        .engine
        .list_reservations_for_user(f.alice)
        .await
        .iter()
        .map(|s| s.id)
        .collect();
    ids.reverse();
    assert_eq!(mine, ids);
    assert_eq!(f.engine.list_all_reservations().await.len(), 4);
    assert!(f.engine.list_reservations_for_user(f.admin).await.is_empty());
}

#[tokio::test]
async fn free_slots_complement_busy_slots() {
    let f = fixture("free_slots.wal").await;
    f.engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine
        .create_reservation(f.bob, booking(f.hall, "2025-03-01", "11:00", "12:30", 5))
        .await
        .unwrap();
    let busy = f.engine.busy_slots(f.hall, "2025-03-01").await.unwrap();
    assert_eq!(
        busy,
        vec![
            Span::new(at("2025-03-01 10:00"), at("2025-03-01 11:00")),
            Span::new(at("2025-03-01 11:00"), at("2025-03-01 12:30")),
        ]
    );
    let free = f.engine.free_slots(f.hall, "2025-03-01").await.unwrap();
    assert_eq!(
        free,
        vec![
            Span::new(at("2025-03-01 00:00"), at("2025-03-01 10:00")),
            Span::new(at("2025-03-01 12:30"), at("2025-03-02 00:00")),
        ]
    );
    assert!(f.engine.busy_slots(f.hall, "2025-03-02").await.unwrap().is_empty());
}

#[tokio::test]
async fn available_facilities_filters_every_constraint() {
    let f = fixture("available.wal").await;
    let lab = Ulid::new();
    let closed = Ulid::new();
    let big = Ulid::new();
    f.engine.create_facility(lab, "Lab", Some(4), true).await.unwrap();
    f.engine.create_facility(closed, "Annex", Some(40), false).await.unwrap();
    f.engine.create_facility(big, "Auditorium", None, true).await.unwrap();
    f.engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();

    let names = |v: Vec<FacilityInfo>| v.into_iter().map(|f| f.name).collect::<Vec<_>>();

    let any = f
        .engine
        .available_facilities("2025-03-01", "10:30", "11:30", None)
        .await
        .unwrap();
    assert_eq!(names(any), vec!["Auditorium", "Lab"]);

    let six = f
        .engine
        .available_facilities("2025-03-01", "12:00", "13:00", Some(6))
        .await
        .unwrap();
    assert_eq!(names(six), vec!["Auditorium", "Main Hall"]);
}

// ── Facility administration ──────────────────────────────

#[tokio::test]
async fn facility_with_history_cannot_be_deleted() {
    let f = fixture("facility_delete.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    f.engine.cancel_reservation(d.id, f.alice).await.unwrap();
    assert!(matches!(
        f.engine.delete_facility(f.hall).await,
        Err(EngineError::FacilityInUse(_))
    ));

    let spare = Ulid::new();
    f.engine.create_facility(spare, "Spare Room", None, true).await.unwrap();
    f.engine.delete_facility(spare).await.unwrap();
    assert!(matches!(
        f.engine.get_facility(spare).await,
        Err(EngineError::NotFound(Entity::Facility, _))
    ));
    assert!(matches!(
        f.engine.delete_facility(spare).await,
        Err(EngineError::NotFound(Entity::Facility, _))
    ));
}

#[tokio::test]
async fn duplicate_registrations_rejected() {
    let f = fixture("duplicates.wal").await;
    assert!(matches!(
        f.engine.register_user(f.alice, "Alice again", Role::Member).await,
        Err(EngineError::AlreadyExists(Entity::User, _))
    ));
    assert!(matches!(
        f.engine.create_facility(f.hall, "Hall again", None, true).await,
        Err(EngineError::AlreadyExists(Entity::Facility, _))
    ));
    assert!(matches!(
        f.engine.create_facility(Ulid::new(), "   ", None, true).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn empty_patches_rejected() {
    let f = fixture("empty_patch.wal").await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    assert!(matches!(
        f.engine
            .update_reservation(d.id, f.alice, ReservationPatch::default())
            .await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        f.engine.update_facility(f.hall, FacilityPatch::default()).await,
        Err(EngineError::Validation(_))
    ));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_have_one_winner() {
    let f = fixture("race.wal").await;
    let engine = Arc::new(f.engine);
    let mut users = Vec::new();
    for i in 0..16 {
        let id = Ulid::new();
        engine
            .register_user(id, &format!("racer {i}"), Role::Member)
            .await
            .unwrap();
        users.push(id);
    }

    let mut handles = Vec::new();
    for (i, user) in users.into_iter().enumerate() {
        let engine = engine.clone();
        let hall = f.hall;
        // Windows shifted by a few minutes so every pair overlaps.
        let start = format!("10:{:02}", i);
        let end = format!("11:{:02}", i);
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(user, booking(hall, "2025-03-01", &start, &end, 2))
                .await
        }));
    }

    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::SlotConflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(engine.busy_slots(f.hall, "2025-03-01").await.unwrap().len(), 1);
}

// ── Notifier ─────────────────────────────────────────────

#[tokio::test]
async fn failed_notification_does_not_roll_back() {
    let f = fixture_with(
        "notify_fail.wal",
        Recorder {
            fail: true,
            ..Default::default()
        },
    )
    .await;
    let d = f
        .engine
        .create_reservation(f.alice, booking(f.hall, "2025-03-01", "10:00", "11:00", 5))
        .await
        .unwrap();
    assert_eq!(f.notices.kinds(), vec![NoticeKind::Submitted]);
    assert!(f.engine.get_reservation(d.id, None).await.is_ok());
    assert!(!f
        .engine
        .check_facility_availability(f.hall, "2025-03-01", "10:00", "11:00")
        .await
        .unwrap());
}

#[tokio::test]
async fn notify_hub_delivers_json_to_requester() {
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(test_wal_path("notify_hub.wal"), hub.clone())
        .unwrap()
        .with_clock(Clock::Fixed(at("2025-03-01 08:00")));
    let alice = Ulid::new();
    engine.register_user(alice, "Alice", Role::Member).await.unwrap();
    let mut rx = hub.subscribe(alice);
    let d = engine
        .create_reservation(alice, {
            let mut b = booking(Ulid::new(), "2025-03-01", "10:00", "11:00", 1);
            b.facility_id = None;
            b
        })
        .await
        .unwrap();
    let payload = rx.recv().await.unwrap();
    assert!(payload.contains(&d.id.to_string()));
    assert!(payload.contains("submitted"));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_schedule_and_log() {
    let path = test_wal_path("replay.wal");
    let notices = Arc::new(Recorder::default());
    let alice = Ulid::new();
    let admin = Ulid::new();
    let hall = Ulid::new();
    let (kept, dropped) = {
        let engine = open(path.clone(), notices.clone()).await;
        engine.register_user(alice, "Alice", Role::Member).await.unwrap();
        engine.register_user(admin, "Dana", Role::Admin).await.unwrap();
        engine.create_facility(hall, "Main Hall", Some(10), true).await.unwrap();
        let kept = engine
            .create_reservation(alice, booking(hall, "2025-03-01", "10:00", "11:00", 5))
            .await
            .unwrap();
        engine
            .update_reservation(
                kept.id,
                alice,
                ReservationPatch {
                    end_time: Some("11:30".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine
            .set_reservation_status(kept.id, "approved", Some(admin), None)
            .await
            .unwrap();
        let dropped = engine
            .create_reservation(alice, booking(hall, "2025-03-01", "14:00", "15:00", 5))
            .await
            .unwrap();
        engine.cancel_reservation(dropped.id, alice).await.unwrap();
        (kept.id, dropped.id)
    };

    let engine = open(path, notices).await;
    let d = engine.get_reservation(kept, None).await.unwrap();
    assert_eq!(d.status, ReservationStatus::Approved);
    assert_eq!(d.end_time, "11:30");
    assert_eq!(d.requester_name.as_deref(), Some("Alice"));
    let actions: Vec<LogAction> = engine
        .approval_log(kept, None)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![LogAction::Submitted, LogAction::Edited, LogAction::Approved]
    );

    // Approved item is back in the index, the canceled one is not.
    assert!(matches!(
        engine
            .create_reservation(alice, booking(hall, "2025-03-01", "11:00", "12:00", 5))
            .await,
        Err(EngineError::SlotConflict { .. })
    ));
    assert!(engine
        .check_facility_availability(hall, "2025-03-01", "14:00", "15:00")
        .await
        .unwrap());
    let canceled = engine.get_reservation(dropped, None).await.unwrap();
    assert_eq!(canceled.status, ReservationStatus::Canceled);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let notices = Arc::new(Recorder::default());
    let alice = Ulid::new();
    let hall = Ulid::new();
    let spare = Ulid::new();
    let live;
    {
        let engine = open(path.clone(), notices.clone()).await;
        engine.register_user(alice, "Alice", Role::Member).await.unwrap();
        engine.create_facility(hall, "Main Hall", Some(10), true).await.unwrap();
        engine.create_facility(spare, "Spare", None, true).await.unwrap();
        engine.delete_facility(spare).await.unwrap();
        for hour in 8..18 {
            let start = format!("{hour:02}:00");
            let end = format!("{hour:02}:45");
            let d = engine
                .create_reservation(alice, booking(hall, "2025-03-01", &start, &end, 2))
                .await
                .unwrap();
            if hour % 2 == 0 {
                engine.cancel_reservation(d.id, alice).await.unwrap();
            }
        }
        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        live = engine.busy_slots(hall, "2025-03-01").await.unwrap();
    }

    let engine = open(path, notices).await;
    assert_eq!(engine.busy_slots(hall, "2025-03-01").await.unwrap(), live);
    assert_eq!(live.len(), 5);
    assert_eq!(engine.list_all_reservations().await.len(), 10);
    assert!(engine.get_facility(spare).await.is_err());
    let canceled = engine
        .list_reservations_for_user(alice)
        .await
        .into_iter()
        .filter(|s| s.status == ReservationStatus::Canceled)
        .count();
    assert_eq!(canceled, 5);
}

#[tokio::test]
async fn limits_are_enforced() {
    let f = fixture("limits.wal").await;
    let long = "n".repeat(MAX_NAME_LEN + 1);
    assert!(matches!(
        f.engine.create_facility(Ulid::new(), &long, None, true).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let over = booking(f.hall, "2025-03-01", "10:00", "11:00", MAX_ATTENDEES + 1);
    assert!(matches!(
        f.engine.create_reservation(f.alice, over).await,
        Err(EngineError::LimitExceeded(_))
    ));
}
