//! Cancellation policy arithmetic.
//!
//! Fees are flat amounts taken from the booking's policy snapshot; refunds are
//! whatever remains of the deposit paid, never negative.

use crate::types::{Booking, CancellationOutcome, Money};
use chrono::{DateTime, Duration, Utc};

/// Outcome of cancelling `booking` at `now`.
///
/// The late fee applies when the appointment is less than
/// `cancellation_hours` away.
#[must_use]
pub fn compute_cancellation_outcome(booking: &Booking, now: DateTime<Utc>) -> CancellationOutcome {
    let until_start = booking.start - now;
    let fee = if until_start < hours(booking.policy.cancellation_hours) {
        booking.policy.late_cancellation_fee
    } else {
        Money::ZERO
    };
    with_fee(booking, fee)
}

/// Outcome of a no-show: the no-show fee is charged.
#[must_use]
pub fn compute_no_show_outcome(booking: &Booking) -> CancellationOutcome {
    with_fee(booking, booking.policy.no_show_fee)
}

/// Fee waived; the whole deposit paid is refunded.
///
/// Used when the engine itself unwinds a booking whose deposit never cleared.
#[must_use]
pub fn waived(booking: &Booking) -> CancellationOutcome {
    with_fee(booking, Money::ZERO)
}

/// Rescheduling is allowed only while the start is more than `reschedule_hours` away.
#[must_use]
pub fn reschedule_allowed(booking: &Booking, now: DateTime<Utc>) -> bool {
    booking.start - now > hours(booking.policy.reschedule_hours)
}

fn with_fee(booking: &Booking, fee: Money) -> CancellationOutcome {
    CancellationOutcome {
        fee,
        refund: booking.deposit_paid.saturating_sub(fee),
    }
}

fn hours(value: u32) -> Duration {
    Duration::hours(i64::from(value))
}
