//! Business metrics for the scheduling engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `careslot_bookings_total{status}` - Booking transitions by resulting status
//! - `careslot_slot_conflicts_total{source}` - Refused locks and lost booking races
//! - `careslot_reminders_total{outcome}` - Reminder dispatch outcomes
//!   (sent, retry, failed, skipped)
//! - `careslot_refunds_cents_total` - Refunds initiated, in cents
//!
//! ## Histograms
//! - `careslot_reminder_dispatch_seconds` - Duration of one dispatch tick

use crate::types::{BookingStatus, Money};
use metrics::{describe_counter, describe_histogram};

/// Register metric descriptions.
///
/// Call once at startup, after the recorder is installed.
pub fn register_metrics() {
    describe_counter!(
        "careslot_bookings_total",
        "Booking transitions by resulting status"
    );
    describe_counter!(
        "careslot_slot_conflicts_total",
        "Slot lock refusals and booking creations lost to a concurrent writer"
    );
    describe_counter!(
        "careslot_reminders_total",
        "Reminder dispatch outcomes (sent, retry, failed, skipped)"
    );
    describe_counter!(
        "careslot_refunds_cents_total",
        "Total refunds initiated in cents"
    );
    describe_histogram!(
        "careslot_reminder_dispatch_seconds",
        "Time taken by one reminder dispatch tick"
    );

    tracing::info!("Scheduling metrics registered");
}

/// Record a booking reaching `status`
pub fn record_booking_status(status: BookingStatus) {
    metrics::counter!("careslot_bookings_total", "status" => status.as_str()).increment(1);
}

/// Record a refused lock or a lost booking race
pub fn record_slot_conflict(source: &'static str) {
    metrics::counter!("careslot_slot_conflicts_total", "source" => source).increment(1);
}

/// Record a reminder dispatch outcome
pub fn record_reminder(outcome: &'static str) {
    metrics::counter!("careslot_reminders_total", "outcome" => outcome).increment(1);
}

/// Record an initiated refund
pub fn record_refund(amount: Money) {
    metrics::counter!("careslot_refunds_cents_total").increment(amount.cents());
}

/// Record how long a dispatch tick took
pub fn record_dispatch_duration(seconds: f64) {
    metrics::histogram!("careslot_reminder_dispatch_seconds").record(seconds);
}
