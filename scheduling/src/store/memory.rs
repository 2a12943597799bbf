//! In-memory [`BookingStore`] for tests and local development.
//!
//! One mutex guards all tables, so every conditional write is a single
//! critical section.

use super::{BookingFilter, BookingStore, StoreFuture};
use crate::error::StoreError;
use crate::types::{
    Booking, BookingId, BookingStatus, HolderId, PaymentIntentId, Provider, ProviderId,
    ReminderId, ReminderKind, ReminderSchedule, ReminderStatus, Service, ServiceId, SlotKey,
    SlotLock,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Tables {
    providers: HashMap<ProviderId, Provider>,
    services: HashMap<ServiceId, Service>,
    bookings: HashMap<BookingId, Booking>,
    locks: HashMap<SlotKey, SlotLock>,
    reminders: HashMap<ReminderId, ReminderSchedule>,
}

impl Tables {
    fn overlaps_active(&self, booking: &Booking, ignore: Option<&BookingId>) -> bool {
        self.bookings.values().any(|existing| {
            Some(&existing.id) != ignore
                && existing.blocks(
                    &booking.provider_id,
                    &booking.service_id,
                    booking.start,
                    booking.end,
                )
        })
    }

    fn locked_by_other(
        &self,
        key: &SlotKey,
        holder: Option<&HolderId>,
        now: DateTime<Utc>,
    ) -> bool {
        self.locks
            .get(key)
            .is_some_and(|lock| lock.is_active(now) && Some(&lock.holder) != holder)
    }

    /// Drop the lock on `key` unless another holder still holds it
    fn consume_lock(&mut self, key: &SlotKey, holder: Option<&HolderId>, now: DateTime<Utc>) {
        if !self.locked_by_other(key, holder, now) {
            self.locks.remove(key);
        }
    }
}

/// [`BookingStore`] backed by hash maps behind one mutex
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BookingStore for InMemoryStore {
    fn put_provider(&self, provider: &Provider) -> StoreFuture<'_, ()> {
        let provider = provider.clone();
        Box::pin(async move {
            self.tables.lock().await.providers.insert(provider.id.clone(), provider);
            Ok(())
        })
    }

    fn get_provider(&self, id: &ProviderId) -> StoreFuture<'_, Option<Provider>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.tables.lock().await.providers.get(&id).cloned()) })
    }

    fn put_service(&self, service: &Service) -> StoreFuture<'_, ()> {
        let service = service.clone();
        Box::pin(async move {
            self.tables.lock().await.services.insert(service.id.clone(), service);
            Ok(())
        })
    }

    fn get_service(&self, id: &ServiceId) -> StoreFuture<'_, Option<Service>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.tables.lock().await.services.get(&id).cloned()) })
    }

    fn get_booking(&self, id: &BookingId) -> StoreFuture<'_, Option<Booking>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.tables.lock().await.bookings.get(&id).cloned()) })
    }

    fn find_booking_by_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> StoreFuture<'_, Option<Booking>> {
        let intent_id = intent_id.clone();
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let found = tables
                .bookings
                .values()
                .filter(|b| b.payment_intent_id.as_ref() == Some(&intent_id))
                .max_by_key(|b| (b.occupies_slot(), b.created_at))
                .cloned();
            Ok(found)
        })
    }

    fn list_bookings(&self, filter: &BookingFilter) -> StoreFuture<'_, Vec<Booking>> {
        let filter = filter.clone();
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let mut bookings: Vec<Booking> = tables
                .bookings
                .values()
                .filter(|b| filter.matches(b))
                .cloned()
                .collect();
            bookings.sort_by(|a, b| {
                a.start.cmp(&b.start).then_with(|| a.created_at.cmp(&b.created_at))
            });
            Ok(bookings)
        })
    }

    fn insert_booking(
        &self,
        booking: &Booking,
        holder: Option<&HolderId>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        let booking = booking.clone();
        let holder = holder.cloned();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let key = booking.slot_key();

            if tables.bookings.contains_key(&booking.id)
                || (booking.occupies_slot() && tables.overlaps_active(&booking, None))
                || tables.locked_by_other(&key, holder.as_ref(), now)
            {
                return Err(StoreError::Conflict);
            }

            tables.consume_lock(&key, holder.as_ref(), now);
            tables.bookings.insert(booking.id.clone(), booking);
            Ok(())
        })
    }

    fn update_booking(&self, booking: &Booking, expected: BookingStatus) -> StoreFuture<'_, ()> {
        let booking = booking.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let stored = tables.bookings.get_mut(&booking.id).ok_or(StoreError::NotFound)?;
            if stored.status != expected {
                return Err(StoreError::Conflict);
            }
            let reminders_sent = stored.reminders_sent.union(booking.reminders_sent);
            let confirmation_sent = stored.confirmation_sent || booking.confirmation_sent;
            *stored = booking;
            stored.reminders_sent = reminders_sent;
            stored.confirmation_sent = confirmation_sent;
            Ok(())
        })
    }

    fn mark_booking_reminder_sent(
        &self,
        booking_id: &BookingId,
        kind: ReminderKind,
    ) -> StoreFuture<'_, bool> {
        let booking_id = booking_id.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let stored = tables.bookings.get_mut(&booking_id).ok_or(StoreError::NotFound)?;
            if stored.reminders_sent.is_sent(kind) {
                return Ok(false);
            }
            stored.reminders_sent.mark(kind);
            Ok(true)
        })
    }

    fn reschedule_booking(
        &self,
        old: &Booking,
        expected: BookingStatus,
        replacement: &Booking,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        let old = old.clone();
        let replacement = replacement.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let stored_status = tables
                .bookings
                .get(&old.id)
                .map(|b| b.status)
                .ok_or(StoreError::NotFound)?;
            let key = replacement.slot_key();

            if stored_status != expected
                || tables.bookings.contains_key(&replacement.id)
                || tables.overlaps_active(&replacement, Some(&old.id))
                || tables.locked_by_other(&key, None, now)
            {
                return Err(StoreError::Conflict);
            }

            tables.consume_lock(&key, None, now);
            tables.bookings.insert(old.id.clone(), old);
            tables.bookings.insert(replacement.id.clone(), replacement);
            Ok(())
        })
    }

    fn try_acquire_lock(
        &self,
        lock: &SlotLock,
        slot_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        let lock = lock.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let key = &lock.key;

            if tables.locked_by_other(key, Some(&lock.holder), now) {
                return Ok(false);
            }
            let booked = tables
                .bookings
                .values()
                .any(|b| b.blocks(&key.provider_id, &key.service_id, key.start, slot_end));
            if booked {
                return Ok(false);
            }

            tables.locks.insert(lock.key.clone(), lock);
            Ok(true)
        })
    }

    fn release_lock(&self, key: &SlotKey, holder: &HolderId) -> StoreFuture<'_, bool> {
        let key = key.clone();
        let holder = holder.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let held = tables.locks.get(&key).is_some_and(|lock| lock.holder == holder);
            if held {
                tables.locks.remove(&key);
            }
            Ok(held)
        })
    }

    fn active_lock(&self, key: &SlotKey, now: DateTime<Utc>) -> StoreFuture<'_, Option<SlotLock>> {
        let key = key.clone();
        Box::pin(async move {
            let tables = self.tables.lock().await;
            Ok(tables.locks.get(&key).filter(|lock| lock.is_active(now)).cloned())
        })
    }

    fn purge_expired_locks(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let before = tables.locks.len();
            tables.locks.retain(|_, lock| lock.is_active(now));
            Ok((before - tables.locks.len()) as u64)
        })
    }

    fn insert_reminder(&self, reminder: &ReminderSchedule) -> StoreFuture<'_, bool> {
        let reminder = reminder.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let exists = tables
                .reminders
                .values()
                .any(|r| r.booking_id == reminder.booking_id && r.kind == reminder.kind);
            if exists {
                return Ok(false);
            }
            tables.reminders.insert(reminder.id.clone(), reminder);
            Ok(true)
        })
    }

    fn reminders_for_booking(
        &self,
        booking_id: &BookingId,
    ) -> StoreFuture<'_, Vec<ReminderSchedule>> {
        let booking_id = booking_id.clone();
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let mut reminders: Vec<ReminderSchedule> = tables
                .reminders
                .values()
                .filter(|r| r.booking_id == booking_id)
                .cloned()
                .collect();
            reminders.sort_by_key(|r| r.scheduled_for);
            Ok(reminders)
        })
    }

    fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ReminderSchedule>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let mut due: Vec<ReminderSchedule> = tables
                .reminders
                .values()
                .filter(|r| r.is_due(now))
                .cloned()
                .collect();
            due.sort_by_key(|r| (r.scheduled_for, r.next_attempt_at));
            due.truncate(limit);
            Ok(due)
        })
    }

    fn mark_reminder_sent(&self, id: &ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let id = id.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let reminder = tables.reminders.get_mut(&id).ok_or(StoreError::NotFound)?;
            if reminder.status != ReminderStatus::Pending {
                return Ok(false);
            }
            reminder.status = ReminderStatus::Sent;
            reminder.sent_at = Some(now);
            Ok(true)
        })
    }

    fn record_reminder_failure(
        &self,
        id: &ReminderId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreFuture<'_, bool> {
        let id = id.clone();
        let error = error.to_string();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let reminder = tables.reminders.get_mut(&id).ok_or(StoreError::NotFound)?;
            if reminder.status != ReminderStatus::Pending {
                return Ok(false);
            }
            reminder.attempts += 1;
            reminder.last_error = Some(error);
            match next_attempt_at {
                Some(at) => reminder.next_attempt_at = at,
                None => reminder.status = ReminderStatus::Failed,
            }
            Ok(true)
        })
    }

    fn cancel_reminders(&self, booking_id: &BookingId) -> StoreFuture<'_, u64> {
        let booking_id = booking_id.clone();
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let mut cancelled = 0;
            for reminder in tables.reminders.values_mut() {
                if reminder.booking_id == booking_id && reminder.status == ReminderStatus::Pending {
                    reminder.status = ReminderStatus::Cancelled;
                    cancelled += 1;
                }
            }
            Ok(cancelled)
        })
    }
}
