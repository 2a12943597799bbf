//! Notification and user-directory collaborators.
//!
//! Template rendering and channel delivery live outside the engine. A failed
//! send is logged (and, for reminders, recorded on the work item) but never
//! undoes a booking transition.

use crate::types::{Booking, ReminderKind, UserId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

/// Who a notification is addressed to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    /// Patient
    pub user_id: UserId,
    /// Display name
    pub name: String,
    /// Email channel
    pub email: Option<String>,
    /// SMS channel
    pub phone: Option<String>,
}

impl Recipient {
    /// Recipient reachable by email
    #[must_use]
    pub fn with_email(
        user_id: impl Into<UserId>,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            email: Some(email.into()),
            phone: None,
        }
    }

    const fn has_channel(&self) -> bool {
        self.email.is_some() || self.phone.is_some()
    }
}

/// Notification delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// The channel refused or timed out
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// The recipient has no email or phone
    #[error("Recipient has no delivery channel")]
    NoChannel,
}

/// Boxed notification future
pub type NotifyFuture = Pin<Box<dyn Future<Output = Result<(), NotificationError>> + Send>>;

/// Boxed directory lookup
pub type RecipientFuture = Pin<Box<dyn Future<Output = Option<Recipient>> + Send>>;

/// Sends booking notifications
pub trait Notifier: Send + Sync {
    /// Booking confirmation
    fn send_confirmation(&self, booking: &Booking, recipient: &Recipient) -> NotifyFuture;

    /// Appointment reminder
    fn send_reminder(
        &self,
        booking: &Booking,
        recipient: &Recipient,
        kind: ReminderKind,
    ) -> NotifyFuture;
}

/// Looks up notification recipients. Also the source of truth for whether a user exists.
pub trait UserDirectory: Send + Sync {
    /// Recipient for `user_id`, `None` if unknown
    fn recipient(&self, user_id: &UserId) -> RecipientFuture;
}

// ============================================================================
// Logging notifier
// ============================================================================

/// Notifier that only writes structured log events
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn send_confirmation(&self, booking: &Booking, recipient: &Recipient) -> NotifyFuture {
        let result = if recipient.has_channel() {
            tracing::info!(
                booking_id = %booking.id,
                reference = %booking.reference,
                user_id = %recipient.user_id,
                start = %booking.start,
                "Booking confirmation sent"
            );
            Ok(())
        } else {
            Err(NotificationError::NoChannel)
        };
        Box::pin(async move { result })
    }

    fn send_reminder(
        &self,
        booking: &Booking,
        recipient: &Recipient,
        kind: ReminderKind,
    ) -> NotifyFuture {
        let result = if recipient.has_channel() {
            tracing::info!(
                booking_id = %booking.id,
                reference = %booking.reference,
                user_id = %recipient.user_id,
                kind = %kind,
                "Appointment reminder sent"
            );
            Ok(())
        } else {
            Err(NotificationError::NoChannel)
        };
        Box::pin(async move { result })
    }
}

// ============================================================================
// Recording notifier
// ============================================================================

/// A notification captured by [`RecordingNotifier`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentNotification {
    /// Confirmation for a booking
    Confirmation {
        /// Booking ID
        booking_id: crate::types::BookingId,
        /// Recipient
        user_id: UserId,
    },
    /// Reminder for a booking
    Reminder {
        /// Booking ID
        booking_id: crate::types::BookingId,
        /// Reminder kind
        kind: ReminderKind,
    },
}

/// Notifier that records deliveries in memory and can be told to fail
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    /// Creates an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with [`NotificationError::Delivery`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful deliveries so far
    #[must_use]
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Reminder deliveries so far
    #[must_use]
    pub fn reminders(&self) -> Vec<(crate::types::BookingId, ReminderKind)> {
        self.sent()
            .into_iter()
            .filter_map(|n| match n {
                SentNotification::Reminder { booking_id, kind } => Some((booking_id, kind)),
                SentNotification::Confirmation { .. } => None,
            })
            .collect()
    }

    fn deliver(&self, notification: SentNotification) -> NotifyFuture {
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(NotificationError::Delivery("recording notifier set to fail".to_string()))
        } else {
            match self.sent.lock() {
                Ok(mut sent) => sent.push(notification),
                Err(poisoned) => poisoned.into_inner().push(notification),
            }
            Ok(())
        };
        Box::pin(async move { result })
    }
}

impl Notifier for RecordingNotifier {
    fn send_confirmation(&self, booking: &Booking, recipient: &Recipient) -> NotifyFuture {
        self.deliver(SentNotification::Confirmation {
            booking_id: booking.id.clone(),
            user_id: recipient.user_id.clone(),
        })
    }

    fn send_reminder(
        &self,
        booking: &Booking,
        _recipient: &Recipient,
        kind: ReminderKind,
    ) -> NotifyFuture {
        self.deliver(SentNotification::Reminder {
            booking_id: booking.id.clone(),
            kind,
        })
    }
}

// ============================================================================
// In-memory directory
// ============================================================================

/// [`UserDirectory`] backed by a map
#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    users: Arc<RwLock<HashMap<UserId, Recipient>>>,
}

impl InMemoryDirectory {
    /// Creates an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a recipient
    pub fn insert(&self, recipient: Recipient) {
        match self.users.write() {
            Ok(mut users) => users.insert(recipient.user_id.clone(), recipient),
            Err(poisoned) => poisoned.into_inner().insert(recipient.user_id.clone(), recipient),
        };
    }

    /// Builder-style [`Self::insert`]
    #[must_use]
    pub fn with(self, recipient: Recipient) -> Self {
        self.insert(recipient);
        self
    }
}

impl UserDirectory for InMemoryDirectory {
    fn recipient(&self, user_id: &UserId) -> RecipientFuture {
        let found = match self.users.read() {
            Ok(users) => users.get(user_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(user_id).cloned(),
        };
        Box::pin(async move { found })
    }
}
