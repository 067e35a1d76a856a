use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use ulid::Ulid;

use super::*;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::pricing::Rates;

const MIN: Ms = 60_000;

const OPEN_8_TO_20: &str = r#"{"recurring": {
    "monday":    {"enabled": true, "slots": [{"start": "08:00", "end": "20:00"}]},
    "tuesday":   {"enabled": true, "slots": [{"start": "08:00", "end": "13:00"}, {"start": "14:00", "end": "20:00"}]},
    "wednesday": {"enabled": true, "slots": [{"start": "08:00", "end": "20:00"}]},
    "thursday":  {"enabled": true, "slots": [{"start": "08:00", "end": "20:00"}]},
    "friday":    {"enabled": true, "slots": [{"start": "08:00", "end": "20:00"}]},
    "saturday":  {"enabled": false},
    "sunday":    {"enabled": false}
}, "exceptions": [{"date": "2030-01-09", "enabled": false, "note": "closed for works"}]}"#;

/// Sunday 2030-01-06, 13:00 in Rome.
fn now() -> Ms {
    DateTime::parse_from_rfc3339("2030-01-06T12:00:00Z")
        .unwrap()
        .timestamp_millis()
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

fn c(s: &str) -> Clock {
    s.parse().unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("deskhold_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &PathBuf) -> Store {
    Store::open(path, Arc::new(NotifyHub::new()), DEFAULT_HOLD_TTL_MS).unwrap()
}

async fn space_with(store: &Store, settings: SpaceSettings) -> SpaceId {
    let id = Ulid::new();
    store
        .register_space(id, Some("Loft".into()), settings, OPEN_8_TO_20.into())
        .await
        .unwrap();
    id
}

async fn space(store: &Store) -> SpaceId {
    space_with(store, SpaceSettings::default()).await
}

fn lock(space_id: SpaceId, start: &str, end: &str, user: &str) -> LockRequest {
    LockRequest {
        space_id,
        date: monday(),
        start_time: c(start),
        end_time: c(end),
        token: Ulid::new(),
        user_id: user.into(),
        seats: 1,
        ttl_ms: None,
    }
}

fn promote(token: Ulid, user: &str, payment_required: bool) -> PromoteRequest {
    PromoteRequest {
        token,
        user_id: user.into(),
        payment_required,
    }
}

// ── Registration ─────────────────────────────────────────

#[tokio::test]
async fn register_and_read_back() {
    let store = open(&test_wal_path("register.wal"));
    let id = space(&store).await;
    let info = store.get_space(id).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("Loft"));
    assert!(info.availability.is_parsed());
    assert!(store.get_availability(id).await.unwrap().is_parsed());
}

#[tokio::test]
async fn duplicate_space_rejected() {
    let store = open(&test_wal_path("dup_space.wal"));
    let id = space(&store).await;
    let err = store
        .register_space(id, None, SpaceSettings::default(), "{}".into())
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::AlreadyExists { id });
}

#[tokio::test]
async fn invalid_settings_rejected() {
    let store = open(&test_wal_path("bad_settings.wal"));
    for settings in [
        SpaceSettings { capacity: 0, ..Default::default() },
        SpaceSettings { slot_interval_minutes: 1, ..Default::default() },
        SpaceSettings { buffer_minutes: 600, ..Default::default() },
        SpaceSettings {
            rates: Rates { per_hour_cents: Some(-500), per_day_cents: None },
            ..Default::default()
        },
        SpaceSettings {
            rates: Rates { per_hour_cents: None, per_day_cents: Some(i64::MAX / 2) },
            ..Default::default()
        },
    ] {
        let err = store
            .register_space(Ulid::new(), None, settings, "{}".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LimitExceeded { .. }), "{err}");
    }
}

#[tokio::test]
async fn unparseable_availability_is_kept_as_unknown() {
    let store = open(&test_wal_path("unparseable.wal"));
    let id = Ulid::new();
    store
        .register_space(id, None, SpaceSettings::default(), "\"not an object\"".into())
        .await
        .unwrap();
    assert!(!store.get_availability(id).await.unwrap().is_parsed());

    // Unknown days accept the fallback hours, nothing else.
    let ok = store.acquire_lock(lock(id, "09:00", "10:00", "u1"), now()).await.unwrap();
    assert!(ok.valid);
    let err = store
        .acquire_lock(lock(id, "19:00", "20:00", "u1"), now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::OutsideAvailability { .. }));
}

#[tokio::test]
async fn remove_space_with_active_claims_fails() {
    let store = open(&test_wal_path("remove_space.wal"));
    let id = space(&store).await;
    let r = store.acquire_lock(lock(id, "09:00", "10:00", "u1"), now()).await.unwrap();
    assert_eq!(
        store.remove_space(id, now()).await.unwrap_err(),
        StoreError::HasActiveClaims { id }
    );

    store.release_hold(r.hold.unwrap().token).await.unwrap();
    store.remove_space(id, now()).await.unwrap();
    assert!(matches!(store.get_space(id).await, Err(StoreError::NotFound { .. })));
}

// ── Reservation lock ─────────────────────────────────────

#[tokio::test]
async fn lock_then_overlap_rejected_with_winner() {
    let store = open(&test_wal_path("overlap.wal"));
    let id = space(&store).await;

    let first = store.acquire_lock(lock(id, "14:00", "15:00", "alice"), now()).await.unwrap();
    assert!(first.valid);
    let winner = first.hold.unwrap();
    assert_eq!(winner.expires_at, now() + DEFAULT_HOLD_TTL_MS);

    let second = store.acquire_lock(lock(id, "14:30", "16:00", "bob"), now()).await.unwrap();
    assert!(!second.valid);
    assert!(second.hold.is_none());
    assert_eq!(second.conflicts.len(), 1);
    assert_eq!(second.conflicts[0].id(), winner.token);
}

#[tokio::test]
async fn adjacent_windows_do_not_conflict() {
    let store = open(&test_wal_path("adjacent.wal"));
    let id = space(&store).await;
    assert!(store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap().valid);
    assert!(store.acquire_lock(lock(id, "10:00", "11:00", "b"), now()).await.unwrap().valid);
    assert!(store.acquire_lock(lock(id, "08:00", "09:00", "c"), now()).await.unwrap().valid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_locks_exactly_one_wins() {
    let store = Arc::new(open(&test_wal_path("race.wal")));
    let id = space(&store).await;

    for round in 0..20 {
        let start = format!("{:02}:00", 8 + round % 12);
        let end = format!("{:02}:00", 9 + round % 12);
        let date = monday() + chrono::Days::new(7 * (round / 12) as u64);
        let mut handles = Vec::new();
        for user in ["alice", "bob", "carol"] {
            let store = store.clone();
            let mut req = lock(id, &start, &end, user);
            req.date = date;
            handles.push(tokio::spawn(async move {
                let token = req.token;
                (token, store.acquire_lock(req, now()).await.unwrap())
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        let winners: Vec<_> = results.iter().filter(|(_, r)| r.valid).collect();
        assert_eq!(winners.len(), 1, "round {round}");
        let winner_token = winners[0].0;
        for (_, r) in results.iter().filter(|(_, r)| !r.valid) {
            assert!(r.conflicts.iter().any(|c| c.id() == winner_token));
        }
    }
}

#[tokio::test]
async fn expired_hold_does_not_block() {
    let store = open(&test_wal_path("expired_hold.wal"));
    let id = space(&store).await;
    let mut req = lock(id, "14:00", "15:00", "alice");
    req.ttl_ms = Some(MIN_HOLD_TTL_MS);
    assert!(store.acquire_lock(req, now()).await.unwrap().valid);

    let later = now() + MIN_HOLD_TTL_MS;
    let r = store.acquire_lock(lock(id, "14:00", "15:00", "bob"), later).await.unwrap();
    assert!(r.valid, "expired hold must not block: {:?}", r.conflicts);
}

#[tokio::test]
async fn buffer_separates_claims() {
    let store = open(&test_wal_path("buffer.wal"));
    let id = space_with(&store, SpaceSettings { buffer_minutes: 15, ..Default::default() }).await;
    assert!(store.acquire_lock(lock(id, "10:00", "11:00", "a"), now()).await.unwrap().valid);
    assert!(!store.acquire_lock(lock(id, "11:00", "12:00", "b"), now()).await.unwrap().valid);
    assert!(!store.acquire_lock(lock(id, "09:00", "09:50", "b"), now()).await.unwrap().valid);
    assert!(store.acquire_lock(lock(id, "11:15", "12:00", "b"), now()).await.unwrap().valid);
}

#[tokio::test]
async fn shared_space_counts_seats() {
    let store = open(&test_wal_path("capacity.wal"));
    let id = space_with(&store, SpaceSettings { capacity: 3, ..Default::default() }).await;

    let mut two = lock(id, "09:00", "12:00", "a");
    two.seats = 2;
    assert!(store.acquire_lock(two, now()).await.unwrap().valid);
    assert!(store.acquire_lock(lock(id, "10:00", "11:00", "b"), now()).await.unwrap().valid);

    let full = store.acquire_lock(lock(id, "10:30", "11:30", "c"), now()).await.unwrap();
    assert!(!full.valid);
    assert_eq!(full.conflicts.len(), 2);
    assert!(store.acquire_lock(lock(id, "11:00", "12:00", "c"), now()).await.unwrap().valid);

    let mut too_many = lock(id, "15:00", "16:00", "d");
    too_many.seats = 4;
    assert!(!store.acquire_lock(too_many, now()).await.unwrap().valid);
}

#[tokio::test]
async fn lock_outside_hours_or_in_past_is_an_error() {
    let store = open(&test_wal_path("outside.wal"));
    let id = space(&store).await;

    let err = store.acquire_lock(lock(id, "07:00", "09:00", "a"), now()).await.unwrap_err();
    assert!(matches!(err, StoreError::OutsideAvailability { .. }));

    // Tuesday has a lunch gap; a window spanning it is outside.
    let mut req = lock(id, "12:00", "15:00", "a");
    req.date = monday().succ_opt().unwrap();
    let err = store.acquire_lock(req, now()).await.unwrap_err();
    assert!(matches!(err, StoreError::OutsideAvailability { .. }));

    // Blocked by an exception.
    let mut req = lock(id, "09:00", "10:00", "a");
    req.date = NaiveDate::from_ymd_opt(2030, 1, 9).unwrap();
    assert!(store.acquire_lock(req, now()).await.is_err());

    let mut req = lock(id, "09:00", "10:00", "a");
    req.date = NaiveDate::from_ymd_opt(2030, 1, 4).unwrap();
    let err = store.acquire_lock(req, now()).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRange { .. }));

    let err = store.acquire_lock(lock(id, "10:00", "10:00", "a"), now()).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRange { .. }));
}

#[tokio::test]
async fn beyond_horizon_is_rejected() {
    let store = open(&test_wal_path("horizon.wal"));
    let id = space(&store).await;
    let mut req = lock(id, "09:00", "10:00", "a");
    req.date = monday() + chrono::Days::new(u64::from(MAX_HORIZON_DAYS) + 7);
    let err = store.acquire_lock(req, now()).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRange { .. }));
}

#[tokio::test]
async fn same_token_replaces_own_hold() {
    let store = open(&test_wal_path("replace.wal"));
    let id = space(&store).await;
    let mut req = lock(id, "09:00", "10:00", "alice");
    assert!(store.acquire_lock(req.clone(), now()).await.unwrap().valid);

    req.start_time = c("09:30");
    req.end_time = c("11:00");
    let r = store.acquire_lock(req.clone(), now()).await.unwrap();
    assert!(r.valid, "own hold must not block its replacement");
    let claims = store.day_claims(id, monday(), now()).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].range().start, c("09:30"));

    req.user_id = "mallory".into();
    assert_eq!(
        store.acquire_lock(req.clone(), now()).await.unwrap_err(),
        StoreError::TokenMismatch { token: req.token }
    );
}

#[tokio::test]
async fn release_frees_the_window() {
    let store = open(&test_wal_path("release.wal"));
    let id = space(&store).await;
    let r = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap();
    let token = r.hold.unwrap().token;
    assert_eq!(store.release_hold(token).await.unwrap(), id);
    assert!(store.acquire_lock(lock(id, "09:00", "10:00", "b"), now()).await.unwrap().valid);
    assert!(matches!(store.release_hold(token).await, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn refresh_extends_live_hold_only() {
    let store = open(&test_wal_path("refresh.wal"));
    let id = space(&store).await;
    let r = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap();
    let hold = r.hold.unwrap();

    let later = now() + 5 * MIN;
    let refreshed = store.refresh_hold(hold.token, None, later).await.unwrap();
    assert_eq!(refreshed.expires_at, later + DEFAULT_HOLD_TTL_MS);

    let way_later = refreshed.expires_at;
    assert_eq!(
        store.refresh_hold(hold.token, None, way_later).await.unwrap_err(),
        StoreError::Expired { id: hold.token }
    );
}

// ── Booking lifecycle ────────────────────────────────────

#[tokio::test]
async fn promote_instant_paid_space_is_pending_until_payment() {
    let store = open(&test_wal_path("promote_pending.wal"));
    let settings = SpaceSettings {
        rates: Rates { per_hour_cents: Some(1000), per_day_cents: Some(6000) },
        ..Default::default()
    };
    let id = space_with(&store, settings).await;
    let hold = store
        .acquire_lock(lock(id, "09:00", "11:30", "alice"), now())
        .await
        .unwrap()
        .hold
        .unwrap();

    let booking = store.promote_hold(promote(hold.token, "alice", true), now()).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Pending);
    assert_eq!(booking.slot_reserved_until, Some(hold.expires_at));
    assert_eq!(booking.reservation_token, Some(hold.token));
    assert_eq!(booking.total_cents, 2500);
    assert!(booking.payment_required);

    // The hold is gone, the booking blocks in its place.
    let claims = store.day_claims(id, monday(), now()).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].id(), booking.id);
    assert!(!store.acquire_lock(lock(id, "10:00", "11:00", "bob"), now()).await.unwrap().valid);

    let confirmed = store
        .transition_booking(booking.id, BookingAction::PaymentCaptured, now())
        .await
        .unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.slot_reserved_until, None);
}

#[tokio::test]
async fn day_rate_applies_from_eight_hours() {
    let store = open(&test_wal_path("day_rate.wal"));
    let settings = SpaceSettings {
        rates: Rates { per_hour_cents: Some(1000), per_day_cents: Some(6000) },
        ..Default::default()
    };
    let id = space_with(&store, settings).await;
    let hold = store
        .acquire_lock(lock(id, "09:00", "17:00", "alice"), now())
        .await
        .unwrap()
        .hold
        .unwrap();
    let booking = store.promote_hold(promote(hold.token, "alice", false), now()).await.unwrap();
    assert_eq!(booking.total_cents, 6000);
    assert_eq!(booking.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn host_approval_flow() {
    let store = open(&test_wal_path("approval.wal"));
    let settings = SpaceSettings { confirmation: ConfirmationMode::HostApproval, ..Default::default() };
    let id = space_with(&store, settings).await;

    let hold = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap().hold.unwrap();
    let booking = store.promote_hold(promote(hold.token, "a", true), now()).await.unwrap();
    assert_eq!(booking.status, BookingStatus::PendingApproval);
    assert_eq!(booking.approval_deadline, Some(now() + APPROVAL_WINDOW_MS));

    let err = store
        .transition_booking(booking.id, BookingAction::PaymentCaptured, now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { status: BookingStatus::PendingApproval, .. }));

    let approved = store.transition_booking(booking.id, BookingAction::Approve, now()).await.unwrap();
    assert_eq!(approved.status, BookingStatus::Pending);
    assert_eq!(approved.slot_reserved_until, Some(now() + PAYMENT_WINDOW_MS));

    // A second request is rejected by the host and frees its window.
    let hold = store.acquire_lock(lock(id, "11:00", "12:00", "b"), now()).await.unwrap().hold.unwrap();
    let other = store.promote_hold(promote(hold.token, "b", false), now()).await.unwrap();
    let rejected = store.transition_booking(other.id, BookingAction::Reject, now()).await.unwrap();
    assert_eq!(rejected.status, BookingStatus::Cancelled);
    assert!(store.acquire_lock(lock(id, "11:00", "12:00", "c"), now()).await.unwrap().valid);
}

#[tokio::test]
async fn approval_after_deadline_fails() {
    let store = open(&test_wal_path("approval_late.wal"));
    let settings = SpaceSettings { confirmation: ConfirmationMode::HostApproval, ..Default::default() };
    let id = space_with(&store, settings).await;
    let hold = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap().hold.unwrap();
    let booking = store.promote_hold(promote(hold.token, "a", false), now()).await.unwrap();
    let late = now() + APPROVAL_WINDOW_MS;
    assert_eq!(
        store.transition_booking(booking.id, BookingAction::Approve, late).await.unwrap_err(),
        StoreError::Expired { id: booking.id }
    );
}

#[tokio::test]
async fn promote_needs_live_hold_of_same_user() {
    let store = open(&test_wal_path("promote_checks.wal"));
    let id = space(&store).await;
    let mut req = lock(id, "09:00", "10:00", "alice");
    req.ttl_ms = Some(MIN_HOLD_TTL_MS);
    let hold = store.acquire_lock(req, now()).await.unwrap().hold.unwrap();

    assert_eq!(
        store.promote_hold(promote(hold.token, "bob", true), now()).await.unwrap_err(),
        StoreError::TokenMismatch { token: hold.token }
    );
    assert_eq!(
        store.promote_hold(promote(hold.token, "alice", true), hold.expires_at).await.unwrap_err(),
        StoreError::Expired { id: hold.token }
    );
    assert!(matches!(
        store.promote_hold(promote(Ulid::new(), "alice", true), now()).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn cancel_confirmed_booking_frees_window() {
    let store = open(&test_wal_path("cancel.wal"));
    let id = space(&store).await;
    let hold = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap().hold.unwrap();
    let booking = store.promote_hold(promote(hold.token, "a", false), now()).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);

    let cancelled = store.cancel_booking(booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert!(store.acquire_lock(lock(id, "09:00", "10:00", "b"), now()).await.unwrap().valid);
    assert!(matches!(
        store.cancel_booking(booking.id).await,
        Err(StoreError::InvalidTransition { status: BookingStatus::Cancelled, .. })
    ));

    match store.find_claim(booking.id).await.unwrap() {
        Claim::Booking(b) => assert_eq!(b.status, BookingStatus::Cancelled),
        other => panic!("expected booking, got {other:?}"),
    }
    assert!(store.day_claims(id, monday(), now()).await.unwrap().iter().all(|c| c.id() != booking.id));
}

#[tokio::test]
async fn cancelled_booking_survives_compaction_and_replay() {
    let path = test_wal_path("cancel_replay.wal");
    let booking = {
        let store = open(&path);
        let id = space(&store).await;
        let hold = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap().hold.unwrap();
        let booking = store.promote_hold(promote(hold.token, "a", false), now()).await.unwrap();
        store.cancel_booking(booking.id).await.unwrap();
        store.compact(now()).await.unwrap();
        booking
    };

    let store = open(&path);
    match store.find_claim(booking.id).await.unwrap() {
        Claim::Booking(b) => assert_eq!(b.status, BookingStatus::Cancelled),
        other => panic!("expected booking, got {other:?}"),
    }
    assert!(store.acquire_lock(lock(booking.space_id, "09:00", "10:00", "b"), now()).await.unwrap().valid);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn check_conflicts_is_advisory_and_lists_overlaps() {
    let store = open(&test_wal_path("check_conflicts.wal"));
    let id = space(&store).await;
    let clear = store.check_conflicts(id, monday(), c("09:00"), c("10:00"), 1, now()).await.unwrap();
    assert_eq!(clear, ConflictReport::default());

    store.acquire_lock(lock(id, "09:30", "10:30", "a"), now()).await.unwrap();
    let report = store.check_conflicts(id, monday(), c("09:00"), c("10:00"), 1, now()).await.unwrap();
    assert!(report.has_conflict);
    assert_eq!(report.conflicting.len(), 1);

    // Reading took nothing: the window is still lockable by someone else.
    assert!(store.acquire_lock(lock(id, "08:00", "09:00", "b"), now()).await.unwrap().valid);
}

#[tokio::test]
async fn alternative_slots_fit_requested_duration() {
    let store = open(&test_wal_path("alternatives.wal"));
    let id = space(&store).await;
    store.acquire_lock(lock(id, "09:00", "19:00", "a"), now()).await.unwrap();

    let alts = store.alternative_slots(id, monday(), 60, now()).await.unwrap();
    let times: Vec<String> = alts.iter().map(|s| s.time.to_string()).collect();
    assert_eq!(times, ["08:00", "19:00"]);
    assert!(alts.iter().all(|s| s.available));

    let alts = store.alternative_slots(id, monday(), 90, now()).await.unwrap();
    assert!(alts.is_empty());
}

#[tokio::test]
async fn day_slots_reflect_claims() {
    let store = open(&test_wal_path("day_slots.wal"));
    let id = space(&store).await;
    store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap();
    let slots = store.day_slots(id, monday(), now()).await.unwrap();
    assert_eq!(slots.len(), 24);
    let busy: Vec<String> = slots
        .iter()
        .filter(|s| !s.available)
        .map(|s| s.time.to_string())
        .collect();
    assert_eq!(busy, ["09:00", "09:30"]);
}

#[tokio::test]
async fn batch_check_reports_free_seats() {
    let store = open(&test_wal_path("batch.wal"));
    let shared = space_with(&store, SpaceSettings { capacity: 4, ..Default::default() }).await;
    let exclusive = space(&store).await;
    let mut req = lock(shared, "09:00", "10:00", "a");
    req.seats = 3;
    store.acquire_lock(req, now()).await.unwrap();
    store.acquire_lock(lock(exclusive, "09:30", "10:30", "a"), now()).await.unwrap();

    let ids = [shared, exclusive, Ulid::new()];
    let out = store.batch_check(&ids, monday(), c("09:00"), c("10:00"), now()).await.unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[&shared], SpotAvailability { available_spots: 1, max_capacity: 4 });
    assert_eq!(out[&exclusive], SpotAvailability { available_spots: 0, max_capacity: 1 });

    let closed = store
        .batch_check(&[shared], monday(), c("06:00"), c("07:00"), now())
        .await
        .unwrap();
    assert_eq!(closed[&shared].available_spots, 0);

    let too_many: Vec<SpaceId> = (0..=MAX_BATCH_SPACES).map(|_| Ulid::new()).collect();
    assert!(matches!(
        store.batch_check(&too_many, monday(), c("09:00"), c("10:00"), now()).await,
        Err(StoreError::LimitExceeded { .. })
    ));
}

// ── Expiry and reaping ───────────────────────────────────

#[tokio::test]
async fn reaper_releases_expired_holds_and_lapsed_bookings() {
    let store = open(&test_wal_path("reap.wal"));
    let id = space(&store).await;

    let mut short = lock(id, "09:00", "10:00", "a");
    short.ttl_ms = Some(MIN_HOLD_TTL_MS);
    store.acquire_lock(short, now()).await.unwrap();

    let long = store.acquire_lock(lock(id, "11:00", "12:00", "b"), now()).await.unwrap().hold.unwrap();

    let mut unpaid = lock(id, "13:00", "14:00", "c");
    unpaid.ttl_ms = Some(2 * MIN);
    let unpaid = store.acquire_lock(unpaid, now()).await.unwrap().hold.unwrap();
    let booking = store.promote_hold(promote(unpaid.token, "c", true), now()).await.unwrap();

    let later = now() + 3 * MIN;
    assert_eq!(store.reap_expired(later).await, ReapStats { holds: 1, bookings: 1 });

    let left = store.day_claims(id, monday(), later).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id(), long.token);
    match store.find_claim(booking.id).await.unwrap() {
        Claim::Booking(b) => assert_eq!(b.status, BookingStatus::Cancelled),
        other => panic!("expected booking, got {other:?}"),
    }
    assert_eq!(store.reap_expired(later).await, ReapStats::default());
}

#[tokio::test]
async fn refreshed_hold_survives_reaping() {
    let store = open(&test_wal_path("reap_refresh.wal"));
    let id = space(&store).await;
    let mut req = lock(id, "09:00", "10:00", "a");
    req.ttl_ms = Some(2 * MIN);
    let hold = store.acquire_lock(req, now()).await.unwrap().hold.unwrap();
    store.refresh_hold(hold.token, None, now() + MIN).await.unwrap();

    assert_eq!(store.reap_expired(now() + 3 * MIN).await, ReapStats::default());
    assert!(store.find_claim(hold.token).await.is_ok());
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_spaces_holds_and_bookings() {
    let path = test_wal_path("replay.wal");
    let (id, hold, booking) = {
        let store = open(&path);
        let id = space(&store).await;
        let hold = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap().hold.unwrap();
        let paid = store.acquire_lock(lock(id, "11:00", "12:00", "b"), now()).await.unwrap().hold.unwrap();
        let booking = store.promote_hold(promote(paid.token, "b", true), now()).await.unwrap();
        store
            .transition_booking(booking.id, BookingAction::PaymentCaptured, now())
            .await
            .unwrap();
        (id, hold, booking)
    };

    let store = open(&path);
    assert_eq!(store.space_count(), 1);
    let claims = store.day_claims(id, monday(), now()).await.unwrap();
    assert_eq!(claims.len(), 2);
    assert_eq!(claims[0], Claim::Hold(hold.clone()));
    match &claims[1] {
        Claim::Booking(b) => {
            assert_eq!(b.id, booking.id);
            assert_eq!(b.status, BookingStatus::Confirmed);
        }
        other => panic!("expected booking, got {other:?}"),
    }
    assert_eq!(store.space_for_claim(&hold.token), Some(id));
    assert!(!store.acquire_lock(lock(id, "09:30", "11:30", "c"), now()).await.unwrap().valid);
}

#[tokio::test]
async fn writes_after_a_torn_tail_survive_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_restart.wal");
    let first = {
        let store = open(&path);
        space(&store).await
    };
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[5u8, 0, 0, 0, 1]).unwrap();
    }

    let second = {
        let store = open(&path);
        assert_eq!(store.space_count(), 1);
        space(&store).await
    };

    let store = open(&path);
    assert_eq!(store.space_count(), 2);
    assert!(store.get_space(first).await.is_ok());
    assert!(store.get_space(second).await.is_ok());
}

#[tokio::test]
async fn group_commit_persists_concurrent_writers() {
    let path = test_wal_path("group_commit.wal");
    let store = Arc::new(open(&path));
    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .register_space(Ulid::new(), Some(format!("Desk {i}")), SpaceSettings::default(), "{}".into())
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(store.wal_appends_since_compact().await, n);
    assert_eq!(open(&path).space_count(), n as usize);
}

#[tokio::test]
async fn compaction_keeps_live_state_only() {
    let path = test_wal_path("compact.wal");
    let id;
    {
        let store = open(&path);
        id = space(&store).await;
        for _ in 0..10 {
            let r = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap();
            store.release_hold(r.hold.unwrap().token).await.unwrap();
        }
        let hold = store.acquire_lock(lock(id, "14:00", "15:00", "a"), now()).await.unwrap().hold.unwrap();
        store.promote_hold(promote(hold.token, "a", false), now()).await.unwrap();
        assert!(store.wal_appends_since_compact().await > 20);

        store.compact(now()).await.unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 0);
        store.acquire_lock(lock(id, "16:00", "17:00", "b"), now()).await.unwrap();
    }

    let events = crate::wal::Wal::replay(&path).unwrap();
    assert_eq!(events.len(), 3);
    let store = open(&path);
    let claims = store.day_claims(id, monday(), now()).await.unwrap();
    assert_eq!(claims.len(), 2);
    assert!(matches!(claims[0], Claim::Booking(_)));
}

#[tokio::test]
async fn watchers_see_applied_events() {
    let store = open(&test_wal_path("notify.wal"));
    let id = space(&store).await;
    let mut rx = store.notify.subscribe(id, None);
    let hold = store.acquire_lock(lock(id, "09:00", "10:00", "a"), now()).await.unwrap().hold.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Event::HoldPlaced { hold: hold.clone() });

    // Rejections do not notify.
    store.acquire_lock(lock(id, "09:00", "10:00", "b"), now()).await.unwrap();
    store.release_hold(hold.token).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), Event::HoldReleased { .. }));
}
