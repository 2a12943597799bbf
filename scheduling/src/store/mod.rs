//! Persistence boundary of the scheduling engine.
//!
//! Every write that guards an invariant is a single conditional operation on
//! the store: booking insertion fails on overlap, lock acquisition is a
//! compare-and-set, booking updates check the expected status, reminder
//! marking only touches pending rows. Callers never read-then-write.

use crate::error::StoreError;
use crate::types::{
    Booking, BookingId, BookingStatus, HolderId, PaymentIntentId, Provider, ProviderId,
    ReminderId, ReminderKind, ReminderSchedule, Service, ServiceId, SlotKey, SlotLock,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresBookingStore;

/// Boxed future returned by every store method
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Booking query
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BookingFilter {
    /// Only this provider
    pub provider_id: Option<ProviderId>,
    /// Only this service
    pub service_id: Option<ServiceId>,
    /// Only bookings ending after this instant
    pub from: Option<DateTime<Utc>>,
    /// Only bookings starting before this instant
    pub to: Option<DateTime<Utc>>,
    /// Skip cancelled and rescheduled bookings
    pub active_only: bool,
}

impl BookingFilter {
    /// Active bookings of one provider and service overlapping `[from, to)`
    #[must_use]
    pub fn active_between(
        provider_id: &ProviderId,
        service_id: &ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id: Some(provider_id.clone()),
            service_id: Some(service_id.clone()),
            from: Some(from),
            to: Some(to),
            active_only: true,
        }
    }

    /// Whether `booking` satisfies the filter
    #[must_use]
    pub fn matches(&self, booking: &Booking) -> bool {
        self.provider_id.as_ref().is_none_or(|id| id == &booking.provider_id)
            && self.service_id.as_ref().is_none_or(|id| id == &booking.service_id)
            && self.from.is_none_or(|from| booking.end > from)
            && self.to.is_none_or(|to| booking.start < to)
            && (!self.active_only || booking.occupies_slot())
    }
}

/// Storage for providers, services, bookings, slot locks and reminders.
///
/// Uses explicit boxed futures so the store can be shared as `Arc<dyn BookingStore>`.
pub trait BookingStore: Send + Sync {
    /// Insert or replace a provider
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn put_provider(&self, provider: &Provider) -> StoreFuture<'_, ()>;

    /// Look up a provider
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn get_provider(&self, id: &ProviderId) -> StoreFuture<'_, Option<Provider>>;

    /// Insert or replace a service
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn put_service(&self, service: &Service) -> StoreFuture<'_, ()>;

    /// Look up a service
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn get_service(&self, id: &ServiceId) -> StoreFuture<'_, Option<Service>>;

    /// Look up a booking
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn get_booking(&self, id: &BookingId) -> StoreFuture<'_, Option<Booking>>;

    /// The booking a deposit intent belongs to.
    ///
    /// A reschedule carries the intent over to the replacement, so the active
    /// booking is preferred over the rescheduled one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn find_booking_by_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> StoreFuture<'_, Option<Booking>>;

    /// Bookings matching `filter`, ordered by start
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn list_bookings(&self, filter: &BookingFilter) -> StoreFuture<'_, Vec<Booking>>;

    /// Insert a new booking atomically.
    ///
    /// Fails with [`StoreError::Conflict`] if an active booking for the same
    /// provider and service overlaps it, or if an active lock on its slot is
    /// held by anyone but `holder`. On success the holder's lock is consumed.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] as above, [`StoreError::Database`] on backend failure.
    fn insert_booking(
        &self,
        booking: &Booking,
        holder: Option<&HolderId>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Replace a booking if its stored status is still `expected`.
    ///
    /// Delivery flags (`confirmation_sent`, `reminders_sent`) already set in
    /// the store stay set, whatever the snapshot says.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if missing, [`StoreError::Conflict`] if the
    /// status moved on.
    fn update_booking(&self, booking: &Booking, expected: BookingStatus) -> StoreFuture<'_, ()>;

    /// Set the delivery flag of `kind` on a booking without touching any
    /// other column. Returns `false` if it was already set.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the booking does not exist.
    fn mark_booking_reminder_sent(
        &self,
        booking_id: &BookingId,
        kind: ReminderKind,
    ) -> StoreFuture<'_, bool>;

    /// Write a rescheduled booking and insert its replacement in one step.
    ///
    /// `old` must still be stored with status `expected`; `replacement` is
    /// checked like [`BookingStore::insert_booking`] with no lock holder, the
    /// old booking excluded from the overlap check.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if either condition fails.
    fn reschedule_booking(
        &self,
        old: &Booking,
        expected: BookingStatus,
        replacement: &Booking,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Take (or refresh) a lock on a slot.
    ///
    /// Returns `false` if another holder's lock is active at `now`, or if an
    /// active booking overlaps `[lock.key.start, slot_end)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn try_acquire_lock(
        &self,
        lock: &SlotLock,
        slot_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// Remove `holder`'s lock on `key`. Returns whether a lock was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn release_lock(&self, key: &SlotKey, holder: &HolderId) -> StoreFuture<'_, bool>;

    /// The lock on `key` still active at `now`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn active_lock(&self, key: &SlotKey, now: DateTime<Utc>) -> StoreFuture<'_, Option<SlotLock>>;

    /// Delete locks expired at `now`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn purge_expired_locks(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Insert a reminder unless one of the same kind exists for the booking.
    /// Returns whether it was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn insert_reminder(&self, reminder: &ReminderSchedule) -> StoreFuture<'_, bool>;

    /// Every reminder of a booking, ordered by fire time
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn reminders_for_booking(
        &self,
        booking_id: &BookingId,
    ) -> StoreFuture<'_, Vec<ReminderSchedule>>;

    /// Pending reminders due at `now`, oldest first, at most `limit`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<ReminderSchedule>>;

    /// Mark a pending reminder sent. Returns `false` if it was not pending.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the reminder does not exist.
    fn mark_reminder_sent(&self, id: &ReminderId, now: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// Record a failed delivery on a pending reminder.
    ///
    /// `next_attempt_at` of `None` gives up and marks the reminder failed.
    /// Returns `false` if it was not pending.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the reminder does not exist.
    fn record_reminder_failure(
        &self,
        id: &ReminderId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreFuture<'_, bool>;

    /// Cancel the pending reminders of a booking. Returns the number cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on backend failure.
    fn cancel_reminders(&self, booking_id: &BookingId) -> StoreFuture<'_, u64>;
}
