//! Domain types for the scheduling engine.
//!
//! Value objects (identifiers, money, weekly hours), the persisted entities
//! (provider, service, booking, slot lock, reminder) and the status enums
//! that drive the booking lifecycle.

use crate::error::StoreError;
use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new random identifier
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Wraps an existing identifier
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a care provider (clinic, practitioner)
    ProviderId
);
string_id!(
    /// Identifier of a bookable service
    ServiceId
);
string_id!(
    /// Identifier of the patient making a booking
    UserId
);
string_id!(
    /// Internal booking identifier
    BookingId
);
string_id!(
    /// Identity of a checkout session holding slot locks
    HolderId
);
string_id!(
    /// Identifier of a reminder work item
    ReminderId
);
string_id!(
    /// Identifier issued by the payment collaborator for a deposit intent
    PaymentIntentId
);

// ============================================================================
// Money
// ============================================================================

/// Money amount in cents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(u64);

impl Money {
    /// Zero cents
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Subtracts, clamping at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// `percentage` percent of this amount, rounded down to the cent
    #[must_use]
    pub const fn percent(self, percentage: u8) -> Self {
        Self(self.0.saturating_mul(percentage as u64) / 100)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Operating hours
// ============================================================================

/// Local wall-clock opening hours for one weekday
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    /// Whether the provider takes appointments on this day
    pub is_open: bool,
    /// Opening time
    pub open: NaiveTime,
    /// Closing time; no slot may end after it
    pub close: NaiveTime,
}

impl DayHours {
    /// Open from `open` until `close`
    #[must_use]
    pub const fn open(open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            is_open: true,
            open,
            close,
        }
    }

    /// Closed all day
    #[must_use]
    pub const fn closed() -> Self {
        Self {
            is_open: false,
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
        }
    }
}

impl Default for DayHours {
    fn default() -> Self {
        Self::closed()
    }
}

/// Weekly operating hours, one entry per weekday starting on Monday
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours([DayHours; 7]);

impl WeeklyHours {
    /// Closed every day
    #[must_use]
    pub fn closed() -> Self {
        Self::default()
    }

    /// Same hours on every listed day, closed otherwise
    #[must_use]
    pub fn on_days(days: &[Weekday], hours: DayHours) -> Self {
        let mut weekly = Self::closed();
        for day in days {
            weekly.set(*day, hours);
        }
        weekly
    }

    /// Replace the hours for one weekday
    pub fn set(&mut self, day: Weekday, hours: DayHours) {
        self.0[day.num_days_from_monday() as usize] = hours;
    }

    /// Builder form of [`WeeklyHours::set`]
    #[must_use]
    pub fn with(mut self, day: Weekday, hours: DayHours) -> Self {
        self.set(day, hours);
        self
    }

    /// Hours for one weekday
    #[must_use]
    pub fn for_day(&self, day: Weekday) -> &DayHours {
        &self.0[day.num_days_from_monday() as usize]
    }
}

// ============================================================================
// Providers and services
// ============================================================================

/// Cancellation and no-show terms a provider applies by default
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    /// Cancelling closer than this to the start incurs the late fee
    pub cancellation_hours: u32,
    /// Rescheduling is only allowed further than this from the start
    pub reschedule_hours: u32,
    /// Fee charged when the patient does not attend
    pub no_show_fee: Money,
    /// Fee charged for a late cancellation
    pub late_cancellation_fee: Money,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            cancellation_hours: 24,
            reschedule_hours: 24,
            no_show_fee: Money::ZERO,
            late_cancellation_fee: Money::ZERO,
        }
    }
}

/// A care provider taking appointments
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Provider ID
    pub id: ProviderId,
    /// Display name
    pub name: String,
    /// Weekly operating hours in local time
    pub hours: WeeklyHours,
    /// Offset of the provider's local time from UTC, in minutes
    pub utc_offset_minutes: i32,
    /// Default cancellation policy
    pub policy: CancellationPolicy,
}

/// A bookable service offered by one provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service ID
    pub id: ServiceId,
    /// Owning provider
    pub provider_id: ProviderId,
    /// Display name
    pub name: String,
    /// Appointment length in minutes
    pub duration_minutes: u32,
    /// Full price
    pub price: Money,
    /// Whether a deposit must be paid before the booking is confirmed
    pub deposit_required: bool,
    /// Deposit as a percentage of the price (0-100)
    pub deposit_percentage: u8,
    /// Instructions shown to the patient before the appointment
    pub preparation_instructions: Option<String>,
    /// Incremented on every edit
    pub version: u32,
}

impl Service {
    /// Appointment length
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    /// Deposit owed at booking time, zero when no deposit is required
    #[must_use]
    pub const fn deposit_amount(&self) -> Money {
        if self.deposit_required {
            self.price.percent(self.deposit_percentage)
        } else {
            Money::ZERO
        }
    }
}

/// Terms captured on the booking at creation time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Late cancellation threshold in hours
    pub cancellation_hours: u32,
    /// Reschedule threshold in hours
    pub reschedule_hours: u32,
    /// No-show fee
    pub no_show_fee: Money,
    /// Late cancellation fee
    pub late_cancellation_fee: Money,
    /// Deposit required flag of the service version booked
    pub deposit_required: bool,
    /// Deposit percentage of the service version booked
    pub deposit_percentage: u8,
}

impl PolicySnapshot {
    /// Capture the provider's policy and the service's deposit terms
    #[must_use]
    pub const fn capture(policy: &CancellationPolicy, service: &Service) -> Self {
        Self {
            cancellation_hours: policy.cancellation_hours,
            reschedule_hours: policy.reschedule_hours,
            no_show_fee: policy.no_show_fee,
            late_cancellation_fee: policy.late_cancellation_fee,
            deposit_required: service.deposit_required,
            deposit_percentage: service.deposit_percentage,
        }
    }
}

// ============================================================================
// Slots and locks
// ============================================================================

/// Identity of a slot: provider, service and start instant
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    /// Provider ID
    pub provider_id: ProviderId,
    /// Service ID
    pub service_id: ServiceId,
    /// Slot start
    pub start: DateTime<Utc>,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.provider_id, self.service_id, self.start.to_rfc3339())
    }
}

/// A candidate appointment interval. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Provider ID
    pub provider_id: ProviderId,
    /// Service ID
    pub service_id: ServiceId,
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
    /// False when an active booking overlaps the slot
    pub available: bool,
}

impl TimeSlot {
    /// Identity of this slot
    #[must_use]
    pub fn key(&self) -> SlotKey {
        SlotKey {
            provider_id: self.provider_id.clone(),
            service_id: self.service_id.clone(),
            start: self.start,
        }
    }
}

/// Exclusive short-lived claim on a slot during checkout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLock {
    /// Slot identity
    pub key: SlotKey,
    /// Checkout session holding the lock
    pub holder: HolderId,
    /// The lock counts as absent once `now` is past this instant
    pub locked_until: DateTime<Utc>,
}

impl SlotLock {
    /// Whether the lock still excludes other holders at `now`
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.locked_until
    }
}

// ============================================================================
// Booking
// ============================================================================

/// Booking lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Created, waiting for confirmation (usually a deposit)
    Pending,
    /// Confirmed; reminders are scheduled
    Confirmed,
    /// Cancelled by the patient, the provider or the system
    Cancelled,
    /// Appointment took place
    Completed,
    /// Patient did not attend
    NoShow,
    /// Replaced by a booking at another time
    Rescheduled,
}

impl BookingStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::NoShow => "no_show",
            Self::Rescheduled => "rescheduled",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "no_show" => Ok(Self::NoShow),
            "rescheduled" => Ok(Self::Rescheduled),
            _ => Err(StoreError::Serialization(format!("Invalid booking status: {s}"))),
        }
    }

    /// No transition leaves a terminal status
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Whether a booking in this status blocks its slot.
    ///
    /// Completed and no-show bookings still occupy their (past) interval.
    #[must_use]
    pub const fn occupies_slot(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Rescheduled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment state of a booking's deposit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// The service takes no deposit
    NotRequired,
    /// A deposit intent is open (or being opened)
    AwaitingDeposit,
    /// Deposit received
    Paid,
    /// The collaborator reported the deposit failed
    Failed,
    /// A refund was initiated
    Refunded,
    /// The refund request failed and needs manual follow-up
    RefundFailed,
}

impl PaymentStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::AwaitingDeposit => "awaiting_deposit",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::RefundFailed => "refund_failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "not_required" => Ok(Self::NotRequired),
            "awaiting_deposit" => Ok(Self::AwaitingDeposit),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            "refund_failed" => Ok(Self::RefundFailed),
            _ => Err(StoreError::Serialization(format!("Invalid payment status: {s}"))),
        }
    }
}

/// Who asked for a cancellation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationActor {
    /// The patient
    User,
    /// The provider
    Provider,
    /// The engine itself, unwinding a booking whose deposit never cleared
    System,
}

impl CancellationActor {
    /// Convert actor to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Provider => "provider",
            Self::System => "system",
        }
    }

    /// Parse actor from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the string doesn't match a known actor.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "user" => Ok(Self::User),
            "provider" => Ok(Self::Provider),
            "system" => Ok(Self::System),
            _ => Err(StoreError::Serialization(format!("Invalid cancellation actor: {s}"))),
        }
    }
}

/// Audit record of a cancellation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    /// Free-text reason
    pub reason: String,
    /// Who cancelled
    pub actor: CancellationActor,
    /// When
    pub cancelled_at: DateTime<Utc>,
}

/// Reminder offsets before an appointment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderKind {
    /// 24 hours before the start
    TwentyFourHours,
    /// 2 hours before the start
    TwoHours,
}

impl ReminderKind {
    /// Every kind, in firing order
    pub const ALL: [Self; 2] = [Self::TwentyFourHours, Self::TwoHours];

    /// How long before the appointment the reminder fires
    #[must_use]
    pub fn offset(&self) -> Duration {
        match self {
            Self::TwentyFourHours => Duration::hours(24),
            Self::TwoHours => Duration::hours(2),
        }
    }

    /// Convert kind to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TwentyFourHours => "24h",
            Self::TwoHours => "2h",
        }
    }

    /// Parse kind from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the string doesn't match a known kind.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "24h" => Ok(Self::TwentyFourHours),
            "2h" => Ok(Self::TwoHours),
            _ => Err(StoreError::Serialization(format!("Invalid reminder kind: {s}"))),
        }
    }
}

impl fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind "reminder sent" flags on a booking
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderFlags {
    /// 24-hour reminder delivered
    pub twenty_four_hours: bool,
    /// 2-hour reminder delivered
    pub two_hours: bool,
}

impl ReminderFlags {
    /// Whether the reminder of `kind` was delivered
    #[must_use]
    pub const fn is_sent(&self, kind: ReminderKind) -> bool {
        match kind {
            ReminderKind::TwentyFourHours => self.twenty_four_hours,
            ReminderKind::TwoHours => self.two_hours,
        }
    }

    /// Record delivery of the reminder of `kind`
    pub fn mark(&mut self, kind: ReminderKind) {
        match kind {
            ReminderKind::TwentyFourHours => self.twenty_four_hours = true,
            ReminderKind::TwoHours => self.two_hours = true,
        }
    }

    /// Flags set on either side. Delivery flags are never cleared.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            twenty_four_hours: self.twenty_four_hours || other.twenty_four_hours,
            two_hours: self.two_hours || other.two_hours,
        }
    }
}

/// An appointment booking. Never hard-deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Internal ID
    pub id: BookingId,
    /// Human-presentable reference (e.g. `CS-7KQ2M9XA`)
    pub reference: String,
    /// Patient
    pub user_id: UserId,
    /// Provider
    pub provider_id: ProviderId,
    /// Service
    pub service_id: ServiceId,
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
    /// Lifecycle status
    pub status: BookingStatus,
    /// Terms captured at booking time
    pub policy: PolicySnapshot,
    /// Price of the service at booking time
    pub total_cost: Money,
    /// Deposit owed before confirmation
    pub deposit_amount: Money,
    /// Deposit received so far
    pub deposit_paid: Money,
    /// Deposit payment state
    pub payment_status: PaymentStatus,
    /// Deposit intent issued by the payment collaborator
    pub payment_intent_id: Option<PaymentIntentId>,
    /// Whether the confirmation notification was delivered
    pub confirmation_sent: bool,
    /// Delivered reminders
    pub reminders_sent: ReminderFlags,
    /// Set once cancelled
    pub cancellation: Option<Cancellation>,
    /// Fee charged on cancellation or no-show
    pub fee_charged: Money,
    /// Refund owed on cancellation or no-show
    pub refund_due: Money,
    /// Replacement booking after a reschedule
    pub rescheduled_to: Option<BookingId>,
    /// Booking this one replaced
    pub rescheduled_from: Option<BookingId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Slot identity of this booking
    #[must_use]
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            provider_id: self.provider_id.clone(),
            service_id: self.service_id.clone(),
            start: self.start,
        }
    }

    /// Whether this booking blocks other bookings from its interval
    #[must_use]
    pub const fn occupies_slot(&self) -> bool {
        self.status.occupies_slot()
    }

    /// Whether this booking is active and overlaps `[start, end)` for the same provider and service
    #[must_use]
    pub fn blocks(
        &self,
        provider_id: &ProviderId,
        service_id: &ServiceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> bool {
        self.occupies_slot()
            && &self.provider_id == provider_id
            && &self.service_id == service_id
            && self.start < end
            && start < self.end
    }

    /// A required deposit has not been received yet
    #[must_use]
    pub fn deposit_outstanding(&self) -> bool {
        self.policy.deposit_required && self.deposit_paid < self.deposit_amount
    }
}

/// Input of a booking creation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingRequest {
    /// Patient
    pub user_id: UserId,
    /// Provider
    pub provider_id: ProviderId,
    /// Service
    pub service_id: ServiceId,
    /// Requested slot start
    pub start: DateTime<Utc>,
    /// Checkout session whose lock on the slot should be consumed
    pub holder: Option<HolderId>,
}

/// Result of applying the cancellation policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationOutcome {
    /// Fee charged
    pub fee: Money,
    /// Refund owed, never negative
    pub refund: Money,
}

// ============================================================================
// Reminders
// ============================================================================

/// Reminder work item status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderStatus {
    /// Waiting to fire (or to be retried)
    Pending,
    /// Delivered
    Sent,
    /// The booking left the confirmed state
    Cancelled,
    /// Retries exhausted
    Failed,
}

impl ReminderStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Serialization(format!("Invalid reminder status: {s}"))),
        }
    }
}

/// Durable reminder work item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderSchedule {
    /// Reminder ID
    pub id: ReminderId,
    /// Booking reminded about
    pub booking_id: BookingId,
    /// Offset kind
    pub kind: ReminderKind,
    /// Fire time, strictly before the booking start
    pub scheduled_for: DateTime<Utc>,
    /// Work item status
    pub status: ReminderStatus,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Earliest time of the next attempt
    pub next_attempt_at: DateTime<Utc>,
    /// Error of the last failed attempt
    pub last_error: Option<String>,
    /// Delivery time
    pub sent_at: Option<DateTime<Utc>>,
}

impl ReminderSchedule {
    /// A fresh pending reminder
    #[must_use]
    pub fn pending(
        booking_id: BookingId,
        kind: ReminderKind,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReminderId::generate(),
            booking_id,
            kind,
            scheduled_for,
            status: ReminderStatus::Pending,
            attempts: 0,
            next_attempt_at: scheduled_for,
            last_error: None,
            sent_at: None,
        }
    }

    /// Whether the item should be dispatched at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReminderStatus::Pending
            && self.scheduled_for <= now
            && self.next_attempt_at <= now
    }
}

// ============================================================================
// Booking references
// ============================================================================

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a human-presentable booking reference such as `CS-7KQ2M9XA`.
///
/// Ambiguous characters (`I`, `O`, `0`, `1`) are never used.
#[must_use]
pub fn generate_reference() -> String {
    let mut rng = rand::thread_rng();
    let code: String = (0..8)
        .map(|_| char::from(REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())]))
        .collect();
    format!("CS-{code}")
}
