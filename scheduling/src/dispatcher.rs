//! Reminder dispatch tick.
//!
//! One [`ReminderDispatcher::dispatch_due`] call drains the due reminder rows:
//! each one is sent, skipped (booking no longer confirmed or already started)
//! or rescheduled for another attempt. The process drives it through
//! [`careslot_runtime::PeriodicRunner`]; tests call it directly.

use crate::error::StoreError;
use crate::metrics;
use crate::notifications::{Notifier, UserDirectory};
use crate::reminders::ReminderScheduler;
use crate::store::BookingStore;
use crate::types::{BookingStatus, ReminderSchedule};
use careslot_core::environment::Clock;
use careslot_runtime::PeriodicTask;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Default number of reminders handled per tick
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Counts from one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Reminders delivered
    pub sent: usize,
    /// Deliveries that failed (retry scheduled or given up)
    pub failed: usize,
    /// Reminders dropped or already handled
    pub skipped: usize,
}

enum Outcome {
    Sent,
    Failed,
    Skipped,
}

/// Sends due reminders
pub struct ReminderDispatcher {
    scheduler: Arc<ReminderScheduler>,
    store: Arc<dyn BookingStore>,
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    purge_locks: bool,
}

impl ReminderDispatcher {
    /// Creates a dispatcher with the default batch size that also purges expired slot locks
    #[must_use]
    pub fn new(
        scheduler: Arc<ReminderScheduler>,
        store: Arc<dyn BookingStore>,
        notifier: Arc<dyn Notifier>,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduler,
            store,
            notifier,
            directory,
            clock,
            batch_size: DEFAULT_BATCH_SIZE,
            purge_locks: true,
        }
    }

    /// Override the per-tick batch size
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enable or disable purging expired slot locks on every tick
    #[must_use]
    pub const fn with_lock_purge(mut self, enabled: bool) -> Self {
        self.purge_locks = enabled;
        self
    }

    /// Handle every reminder due at `now`, one batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the due query fails. Failures on single
    /// reminders are logged and counted instead.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, StoreError> {
        let started = Instant::now();
        let due = self.scheduler.due_reminders(now, self.batch_size).await?;
        let mut report = DispatchReport::default();

        for reminder in due {
            let outcome = match self.dispatch_one(&reminder, now).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(
                        reminder_id = %reminder.id,
                        error = %error,
                        "Reminder dispatch failed"
                    );
                    Outcome::Failed
                },
            };
            match outcome {
                Outcome::Sent => {
                    report.sent += 1;
                    metrics::record_reminder("sent");
                },
                Outcome::Failed => report.failed += 1,
                Outcome::Skipped => {
                    report.skipped += 1;
                    metrics::record_reminder("skipped");
                },
            }
        }

        if self.purge_locks {
            match self.store.purge_expired_locks(now).await {
                Ok(0) => {},
                Ok(purged) => tracing::debug!(purged, "Expired slot locks purged"),
                Err(error) => tracing::warn!(error = %error, "Slot lock purge failed"),
            }
        }

        metrics::record_dispatch_duration(started.elapsed().as_secs_f64());
        if report != DispatchReport::default() {
            tracing::info!(
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Reminder dispatch finished"
            );
        }
        Ok(report)
    }

    async fn dispatch_one(
        &self,
        reminder: &ReminderSchedule,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        let booking = match self.store.get_booking(&reminder.booking_id).await? {
            Some(booking) if booking.status == BookingStatus::Confirmed && now < booking.start => {
                booking
            },
            _ => {
                self.scheduler.cancel_for_booking(&reminder.booking_id).await?;
                tracing::debug!(
                    reminder_id = %reminder.id,
                    "Reminder dropped, booking no longer upcoming"
                );
                return Ok(Outcome::Skipped);
            },
        };

        // Delivered before, but the row update was lost
        if booking.reminders_sent.is_sent(reminder.kind) {
            self.scheduler.mark_sent(&reminder.id).await?;
            return Ok(Outcome::Skipped);
        }

        let Some(recipient) = self.directory.recipient(&booking.user_id).await else {
            self.fail(reminder, "recipient not found").await?;
            return Ok(Outcome::Failed);
        };

        if let Err(error) = self.notifier.send_reminder(&booking, &recipient, reminder.kind).await {
            self.fail(reminder, &error.to_string()).await?;
            return Ok(Outcome::Failed);
        }

        if !self.scheduler.mark_sent(&reminder.id).await? {
            return Ok(Outcome::Skipped);
        }

        let flagged = self.store.mark_booking_reminder_sent(&booking.id, reminder.kind).await;
        if let Err(error) = flagged {
            tracing::warn!(
                booking_id = %booking.id,
                error = %error,
                "Reminder flag not recorded on booking"
            );
        }
        tracing::info!(
            booking_id = %booking.id,
            reference = %booking.reference,
            kind = %reminder.kind,
            "Reminder sent"
        );
        Ok(Outcome::Sent)
    }

    async fn fail(&self, reminder: &ReminderSchedule, error: &str) -> Result<(), StoreError> {
        let retrying = self.scheduler.record_failure(reminder, error).await?;
        metrics::record_reminder(if retrying { "retry" } else { "failed" });
        Ok(())
    }
}

impl PeriodicTask for ReminderDispatcher {
    fn name(&self) -> &str {
        "reminder-dispatcher"
    }

    fn tick(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            self.dispatch_due(self.clock.now())
                .await
                .map(|_| ())
                .map_err(|error| error.to_string())
        })
    }
}
