//! Reminder scheduling.
//!
//! Reminders are durable rows, one per (booking, kind). Retries are a property
//! of the row (`attempts`, `next_attempt_at`), so a restart loses nothing.

use crate::error::StoreError;
use crate::store::BookingStore;
use crate::types::{Booking, BookingId, ReminderId, ReminderKind, ReminderSchedule};
use careslot_core::environment::Clock;
use careslot_runtime::RetryPolicy;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Default number of delivery attempts before a reminder is marked failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Computes, stores and tracks reminder work items
#[derive(Clone)]
pub struct ReminderScheduler {
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    max_attempts: u32,
}

impl ReminderScheduler {
    /// Creates a scheduler with 30s..1h exponential retry and 5 attempts
    #[must_use]
    pub fn new(store: Arc<dyn BookingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::builder()
                .initial_delay(std::time::Duration::from_secs(30))
                .max_delay(std::time::Duration::from_secs(3600))
                .multiplier(2.0)
                .build(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the retry schedule and attempt budget
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy, max_attempts: u32) -> Self {
        self.retry = retry;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Reminders to create for `booking` when confirmed at `now`.
    ///
    /// A kind whose fire time is not strictly between `now` and the start is
    /// skipped for good.
    #[must_use]
    pub fn plan(booking: &Booking, now: DateTime<Utc>) -> Vec<ReminderSchedule> {
        ReminderKind::ALL
            .iter()
            .filter_map(|kind| {
                let scheduled_for = booking.start - kind.offset();
                (now < scheduled_for && scheduled_for < booking.start)
                    .then(|| ReminderSchedule::pending(booking.id.clone(), *kind, scheduled_for))
            })
            .collect()
    }

    /// Persist the planned reminders of a confirmed booking.
    ///
    /// Idempotent: kinds already stored for the booking are left alone.
    /// Returns the reminders actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if an insert fails.
    pub async fn schedule_for(
        &self,
        booking: &Booking,
    ) -> Result<Vec<ReminderSchedule>, StoreError> {
        let mut inserted = Vec::new();
        for reminder in Self::plan(booking, self.clock.now()) {
            if self.store.insert_reminder(&reminder).await? {
                inserted.push(reminder);
            }
        }
        tracing::debug!(booking_id = %booking.id, count = inserted.len(), "Reminders scheduled");
        Ok(inserted)
    }

    /// Pending reminders due at `now`, at most `limit`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on store failure.
    pub async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReminderSchedule>, StoreError> {
        self.store.due_reminders(now, limit).await
    }

    /// Every reminder of a booking
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on store failure.
    pub async fn for_booking(
        &self,
        booking_id: &BookingId,
    ) -> Result<Vec<ReminderSchedule>, StoreError> {
        self.store.reminders_for_booking(booking_id).await
    }

    /// Mark a reminder sent. Returns `false` if it was already sent (or no longer pending).
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the reminder does not exist.
    pub async fn mark_sent(&self, id: &ReminderId) -> Result<bool, StoreError> {
        self.store.mark_reminder_sent(id, self.clock.now()).await
    }

    /// Record a failed delivery.
    ///
    /// Schedules the next attempt with exponential backoff, or marks the
    /// reminder failed once the attempt budget is spent. Returns whether
    /// another attempt is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on store failure.
    pub async fn record_failure(
        &self,
        reminder: &ReminderSchedule,
        error: &str,
    ) -> Result<bool, StoreError> {
        let next_attempt_at = self.next_attempt_at(reminder.attempts + 1);
        self.store
            .record_reminder_failure(&reminder.id, error, next_attempt_at)
            .await?;

        match next_attempt_at {
            Some(at) => tracing::warn!(
                reminder_id = %reminder.id,
                booking_id = %reminder.booking_id,
                attempts = reminder.attempts + 1,
                next_attempt_at = %at,
                error,
                "Reminder delivery failed, retry scheduled"
            ),
            None => tracing::error!(
                reminder_id = %reminder.id,
                booking_id = %reminder.booking_id,
                attempts = reminder.attempts + 1,
                error,
                "Reminder delivery failed, giving up"
            ),
        }
        Ok(next_attempt_at.is_some())
    }

    /// Cancel the pending reminders of a booking. Returns how many were cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on store failure.
    pub async fn cancel_for_booking(&self, booking_id: &BookingId) -> Result<u64, StoreError> {
        self.store.cancel_reminders(booking_id).await
    }

    /// When attempt number `attempts + 1` may run, or `None` if the budget is spent
    fn next_attempt_at(&self, attempts: u32) -> Option<DateTime<Utc>> {
        if attempts >= self.max_attempts {
            return None;
        }
        let delay = self.retry.delay_for_attempt(attempts.saturating_sub(1) as usize);
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::hours(1));
        Some(self.clock.now() + delay)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{
        BookingStatus, Money, PaymentStatus, PolicySnapshot, ReminderFlags, ReminderStatus,
    };
    use careslot_testing::{MutableClock, test_epoch};

    fn booking_starting_in(hours: i64) -> Booking {
        let start = test_epoch() + Duration::hours(hours);
        Booking {
            id: BookingId::generate(),
            reference: "CS-REMINDME".to_string(),
            user_id: "user-1".into(),
            provider_id: "prov-1".into(),
            service_id: "svc-1".into(),
            start,
            end: start + Duration::minutes(30),
            status: BookingStatus::Confirmed,
            policy: PolicySnapshot {
                cancellation_hours: 24,
                reschedule_hours: 24,
                no_show_fee: Money::ZERO,
                late_cancellation_fee: Money::ZERO,
                deposit_required: false,
                deposit_percentage: 0,
            },
            total_cost: Money::from_cents(4_000),
            deposit_amount: Money::ZERO,
            deposit_paid: Money::ZERO,
            payment_status: PaymentStatus::NotRequired,
            payment_intent_id: None,
            confirmation_sent: false,
            reminders_sent: ReminderFlags::default(),
            cancellation: None,
            fee_charged: Money::ZERO,
            refund_due: Money::ZERO,
            rescheduled_to: None,
            rescheduled_from: None,
            created_at: test_epoch(),
            updated_at: test_epoch(),
        }
    }

    fn scheduler(clock: &MutableClock) -> (ReminderScheduler, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = ReminderScheduler::new(store.clone(), Arc::new(clock.clone())).with_retry(
            RetryPolicy::builder()
                .initial_delay(std::time::Duration::from_secs(30))
                .max_delay(std::time::Duration::from_secs(3600))
                .build(),
            3,
        );
        (scheduler, store)
    }

    #[test]
    fn test_plan_skips_past_fire_times() {
        let now = test_epoch();

        let far = ReminderScheduler::plan(&booking_starting_in(48), now);
        let kinds: Vec<ReminderKind> = far.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, ReminderKind::ALL.to_vec());
        assert_eq!(far[0].scheduled_for, test_epoch() + Duration::hours(24));

        let soon = ReminderScheduler::plan(&booking_starting_in(5), now);
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0].kind, ReminderKind::TwoHours);

        assert!(ReminderScheduler::plan(&booking_starting_in(1), now).is_empty());
        // Fire time exactly now is not in the future
        assert!(ReminderScheduler::plan(&booking_starting_in(2), now).is_empty());
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent_per_kind() {
        let clock = MutableClock::at(test_epoch());
        let (scheduler, _store) = scheduler(&clock);
        let booking = booking_starting_in(48);

        assert_eq!(scheduler.schedule_for(&booking).await.unwrap().len(), 2);
        assert!(scheduler.schedule_for(&booking).await.unwrap().is_empty());
        assert_eq!(scheduler.for_booking(&booking.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_sent_is_idempotent() {
        let clock = MutableClock::at(test_epoch());
        let (scheduler, _store) = scheduler(&clock);
        let booking = booking_starting_in(48);
        scheduler.schedule_for(&booking).await.unwrap();

        clock.advance(Duration::hours(24));
        let due = scheduler.due_reminders(clock.now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kind, ReminderKind::TwentyFourHours);

        assert!(scheduler.mark_sent(&due[0].id).await.unwrap());
        assert!(!scheduler.mark_sent(&due[0].id).await.unwrap());
        assert!(scheduler.due_reminders(clock.now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_back_off_then_give_up() {
        let clock = MutableClock::at(test_epoch());
        let (scheduler, _store) = scheduler(&clock);
        let booking = booking_starting_in(3);
        scheduler.schedule_for(&booking).await.unwrap();
        clock.advance(Duration::hours(1));

        let reminder = scheduler.due_reminders(clock.now(), 10).await.unwrap().remove(0);
        assert!(scheduler.record_failure(&reminder, "smtp down").await.unwrap());

        // Not due again until the 30s backoff elapses
        assert!(scheduler.due_reminders(clock.now(), 10).await.unwrap().is_empty());
        clock.advance(Duration::seconds(30));
        let reminder = scheduler.due_reminders(clock.now(), 10).await.unwrap().remove(0);
        assert_eq!(reminder.attempts, 1);

        assert!(scheduler.record_failure(&reminder, "smtp down").await.unwrap());
        clock.advance(Duration::seconds(60));
        let reminder = scheduler.due_reminders(clock.now(), 10).await.unwrap().remove(0);
        assert_eq!(reminder.attempts, 2);

        assert!(!scheduler.record_failure(&reminder, "smtp down").await.unwrap());
        let stored = scheduler.for_booking(&booking.id).await.unwrap().remove(0);
        assert_eq!(stored.status, ReminderStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.last_error.as_deref(), Some("smtp down"));
    }

    #[tokio::test]
    async fn test_cancel_only_touches_pending() {
        let clock = MutableClock::at(test_epoch());
        let (scheduler, _store) = scheduler(&clock);
        let booking = booking_starting_in(48);
        scheduler.schedule_for(&booking).await.unwrap();

        clock.advance(Duration::hours(24));
        let due = scheduler.due_reminders(clock.now(), 10).await.unwrap();
        scheduler.mark_sent(&due[0].id).await.unwrap();

        assert_eq!(scheduler.cancel_for_booking(&booking.id).await.unwrap(), 1);
        let statuses: Vec<ReminderStatus> = scheduler
            .for_booking(&booking.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses, vec![ReminderStatus::Sent, ReminderStatus::Cancelled]);
    }
}
