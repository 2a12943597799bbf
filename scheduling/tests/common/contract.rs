//! Behaviour every [`BookingStore`] must show, run against each backend.

use super::{CONSULT, PROVIDER, THERAPY, at, booking_row, consult, provider, therapy};
use careslot_scheduling::{
    BookingFilter, BookingId, BookingStatus, BookingStore, HolderId, PaymentIntentId,
    ReminderKind, ReminderSchedule, ReminderStatus, SlotKey, SlotLock, StoreError,
};
use chrono::{DateTime, Duration, Utc};

pub async fn seed(store: &dyn BookingStore) {
    store.put_provider(&provider()).await.unwrap();
    store.put_service(&consult()).await.unwrap();
    store.put_service(&therapy()).await.unwrap();
}

fn key(service_id: &str, hour: u32) -> SlotKey {
    SlotKey {
        provider_id: PROVIDER.into(),
        service_id: service_id.into(),
        start: at(1, hour, 0),
    }
}

fn lock(service_id: &str, hour: u32, holder: &str, minutes: i64) -> SlotLock {
    SlotLock {
        key: key(service_id, hour),
        holder: HolderId::from(holder),
        locked_until: at(0, 8, 0) + Duration::minutes(minutes),
    }
}

async fn acquire(
    store: &dyn BookingStore,
    lock: SlotLock,
    slot_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    store.try_acquire_lock(&lock, slot_end, now).await.unwrap()
}

pub async fn offering_round_trips(store: &dyn BookingStore) {
    seed(store).await;

    assert_eq!(store.get_provider(&PROVIDER.into()).await.unwrap(), Some(provider()));
    assert_eq!(store.get_service(&THERAPY.into()).await.unwrap(), Some(therapy()));
    assert_eq!(store.get_service(&"svc-unknown".into()).await.unwrap(), None);
}

pub async fn overlapping_insert_conflicts(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);

    let first = booking_row("b-overlap-1", CONSULT, at(1, 10, 0), BookingStatus::Confirmed);
    store.insert_booking(&first, None, now).await.unwrap();

    let same_slot = booking_row("b-overlap-2", CONSULT, at(1, 10, 0), BookingStatus::Pending);
    assert_eq!(store.insert_booking(&same_slot, None, now).await, Err(StoreError::Conflict));

    // Another service of the same provider has its own calendar
    let other_service = booking_row("b-overlap-3", THERAPY, at(1, 10, 0), BookingStatus::Pending);
    store.insert_booking(&other_service, None, now).await.unwrap();

    // Back-to-back intervals do not overlap
    let adjacent = booking_row("b-overlap-4", CONSULT, at(1, 10, 30), BookingStatus::Pending);
    store.insert_booking(&adjacent, None, now).await.unwrap();

    let listed = store
        .list_bookings(&BookingFilter::active_between(
            &PROVIDER.into(),
            &CONSULT.into(),
            at(1, 9, 0),
            at(1, 17, 0),
        ))
        .await
        .unwrap();
    let ids: Vec<&str> = listed.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["b-overlap-1", "b-overlap-4"]);
}

pub async fn update_is_compare_and_set(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let pending = booking_row("b-cas", CONSULT, at(1, 11, 0), BookingStatus::Pending);
    store.insert_booking(&pending, None, now).await.unwrap();

    let mut confirmed = pending.clone();
    confirmed.status = BookingStatus::Confirmed;
    store.update_booking(&confirmed, BookingStatus::Pending).await.unwrap();

    let mut cancelled = pending.clone();
    cancelled.status = BookingStatus::Cancelled;
    assert_eq!(
        store.update_booking(&cancelled, BookingStatus::Pending).await,
        Err(StoreError::Conflict)
    );

    let stored = store.get_booking(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);

    let missing = booking_row("b-missing", CONSULT, at(1, 12, 0), BookingStatus::Pending);
    assert_eq!(
        store.update_booking(&missing, BookingStatus::Pending).await,
        Err(StoreError::NotFound)
    );
}

pub async fn cancelled_booking_frees_slot(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let original = booking_row("b-free-1", CONSULT, at(1, 13, 0), BookingStatus::Confirmed);
    store.insert_booking(&original, None, now).await.unwrap();

    let mut cancelled = original.clone();
    cancelled.status = BookingStatus::Cancelled;
    store.update_booking(&cancelled, BookingStatus::Confirmed).await.unwrap();

    let again = booking_row("b-free-2", CONSULT, at(1, 13, 0), BookingStatus::Pending);
    store.insert_booking(&again, None, now).await.unwrap();
}

pub async fn locks_exclude_other_holders(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let slot_end = at(1, 14, 30);

    assert!(acquire(store, lock(CONSULT, 14, "checkout-a", 10), slot_end, now).await);
    assert!(!acquire(store, lock(CONSULT, 14, "checkout-b", 10), slot_end, now).await);
    // Same holder refreshes
    assert!(acquire(store, lock(CONSULT, 14, "checkout-a", 20), slot_end, now).await);

    // A booking without the holder is refused while the lock is active
    let intruder = booking_row("b-locked-1", CONSULT, at(1, 14, 0), BookingStatus::Pending);
    assert_eq!(store.insert_booking(&intruder, None, now).await, Err(StoreError::Conflict));

    // The holder's booking consumes the lock
    let holder = HolderId::from("checkout-a");
    let owned = booking_row("b-locked-2", CONSULT, at(1, 14, 0), BookingStatus::Pending);
    store.insert_booking(&owned, Some(&holder), now).await.unwrap();
    assert_eq!(store.active_lock(&key(CONSULT, 14), now).await.unwrap(), None);

    // A booked slot cannot be locked
    assert!(!acquire(store, lock(CONSULT, 14, "checkout-c", 10), slot_end, now).await);
}

pub async fn expired_locks_are_ignored_and_purged(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let slot_end = at(1, 15, 30);

    assert!(acquire(store, lock(CONSULT, 15, "checkout-a", 10), slot_end, now).await);
    let later = now + Duration::minutes(11);
    assert_eq!(store.active_lock(&key(CONSULT, 15), later).await.unwrap(), None);
    assert!(acquire(store, lock(CONSULT, 15, "checkout-b", 30), slot_end, later).await);

    assert!(acquire(store, lock(CONSULT, 16, "checkout-c", 5), at(1, 16, 30), now).await);
    assert_eq!(store.purge_expired_locks(later).await.unwrap(), 1);
    assert!(store.active_lock(&key(CONSULT, 15), later).await.unwrap().is_some());

    assert!(!store.release_lock(&key(CONSULT, 15), &HolderId::from("checkout-a")).await.unwrap());
    assert!(store.release_lock(&key(CONSULT, 15), &HolderId::from("checkout-b")).await.unwrap());
    assert_eq!(store.active_lock(&key(CONSULT, 15), later).await.unwrap(), None);
}

pub async fn reschedule_is_atomic(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let original = booking_row("b-move-1", CONSULT, at(2, 10, 0), BookingStatus::Confirmed);
    let blocker = booking_row("b-move-2", CONSULT, at(2, 11, 0), BookingStatus::Confirmed);
    store.insert_booking(&original, None, now).await.unwrap();
    store.insert_booking(&blocker, None, now).await.unwrap();

    let mut old = original.clone();
    old.status = BookingStatus::Rescheduled;
    old.rescheduled_to = Some(BookingId::from("b-move-3"));

    // Target taken: nothing changes
    let mut taken = booking_row("b-move-3", CONSULT, at(2, 11, 0), BookingStatus::Confirmed);
    taken.rescheduled_from = Some(original.id.clone());
    assert_eq!(
        store.reschedule_booking(&old, BookingStatus::Confirmed, &taken, now).await,
        Err(StoreError::Conflict)
    );
    assert_eq!(
        store.get_booking(&original.id).await.unwrap().unwrap().status,
        BookingStatus::Confirmed
    );

    // Moving into a slot overlapping only itself is allowed
    let mut shifted = booking_row("b-move-3", CONSULT, at(2, 10, 0), BookingStatus::Confirmed);
    shifted.rescheduled_from = Some(original.id.clone());
    store.reschedule_booking(&old, BookingStatus::Confirmed, &shifted, now).await.unwrap();

    assert_eq!(
        store.get_booking(&original.id).await.unwrap().unwrap().status,
        BookingStatus::Rescheduled
    );
    assert!(store.get_booking(&shifted.id).await.unwrap().is_some());

    // Stale expectation
    assert_eq!(
        store.reschedule_booking(&old, BookingStatus::Confirmed, &shifted, now).await,
        Err(StoreError::Conflict)
    );
}

pub async fn intent_lookup_prefers_active_booking(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let intent = PaymentIntentId::from("pi_contract");

    let mut old = booking_row("b-intent-1", THERAPY, at(3, 10, 0), BookingStatus::Rescheduled);
    old.payment_intent_id = Some(intent.clone());
    let mut current = booking_row("b-intent-2", THERAPY, at(3, 12, 0), BookingStatus::Pending);
    current.payment_intent_id = Some(intent.clone());
    store.insert_booking(&old, None, now).await.unwrap();
    store.insert_booking(&current, None, now).await.unwrap();

    let found = store.find_booking_by_intent(&intent).await.unwrap().unwrap();
    assert_eq!(found.id, current.id);
    assert_eq!(store.find_booking_by_intent(&"pi_unknown".into()).await.unwrap(), None);
}

pub async fn reminders_are_unique_and_claimed_once(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let booking = booking_row("b-remind", CONSULT, at(2, 10, 0), BookingStatus::Confirmed);
    store.insert_booking(&booking, None, now).await.unwrap();

    let pending = |kind, when| ReminderSchedule::pending(booking.id.clone(), kind, when);
    let day_before = pending(ReminderKind::TwentyFourHours, at(1, 10, 0));
    let two_hours = pending(ReminderKind::TwoHours, at(2, 8, 0));
    let duplicate = pending(ReminderKind::TwentyFourHours, at(1, 10, 0));

    assert!(store.insert_reminder(&day_before).await.unwrap());
    assert!(store.insert_reminder(&two_hours).await.unwrap());
    assert!(!store.insert_reminder(&duplicate).await.unwrap());
    assert_eq!(store.reminders_for_booking(&booking.id).await.unwrap().len(), 2);

    assert!(store.due_reminders(now, 10).await.unwrap().is_empty());
    let due = store.due_reminders(at(1, 10, 0), 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, day_before.id);

    assert!(store.mark_reminder_sent(&day_before.id, at(1, 10, 0)).await.unwrap());
    assert!(!store.mark_reminder_sent(&day_before.id, at(1, 10, 1)).await.unwrap());

    let retry_at = at(2, 8, 5);
    let failure = store.record_reminder_failure(&two_hours.id, "smtp timeout", Some(retry_at));
    assert!(failure.await.unwrap());
    assert!(store.due_reminders(at(2, 8, 1), 10).await.unwrap().is_empty());
    let retried = store.due_reminders(retry_at, 10).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].attempts, 1);
    assert_eq!(retried[0].last_error.as_deref(), Some("smtp timeout"));

    assert_eq!(store.cancel_reminders(&booking.id).await.unwrap(), 1);
    let statuses: Vec<ReminderStatus> = store
        .reminders_for_booking(&booking.id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(statuses, vec![ReminderStatus::Sent, ReminderStatus::Cancelled]);
    assert_eq!(
        store.mark_reminder_sent(&"missing".into(), now).await,
        Err(StoreError::NotFound)
    );
}

pub async fn reminder_flags_survive_stale_snapshots(store: &dyn BookingStore) {
    seed(store).await;
    let now = at(0, 8, 0);
    let snapshot = booking_row("b-flags", CONSULT, at(2, 14, 0), BookingStatus::Confirmed);
    store.insert_booking(&snapshot, None, now).await.unwrap();

    let kind = ReminderKind::TwentyFourHours;
    assert!(store.mark_booking_reminder_sent(&snapshot.id, kind).await.unwrap());
    assert!(!store.mark_booking_reminder_sent(&snapshot.id, kind).await.unwrap());

    // A writer still holding the pre-dispatch row records its own change
    let mut stale = snapshot.clone();
    stale.confirmation_sent = true;
    store.update_booking(&stale, BookingStatus::Confirmed).await.unwrap();

    let stored = store.get_booking(&snapshot.id).await.unwrap().unwrap();
    assert!(stored.confirmation_sent);
    assert!(stored.reminders_sent.is_sent(ReminderKind::TwentyFourHours));
    assert!(!stored.reminders_sent.is_sent(ReminderKind::TwoHours));

    assert_eq!(
        store.mark_booking_reminder_sent(&"b-unknown".into(), ReminderKind::TwoHours).await,
        Err(StoreError::NotFound)
    );
}
