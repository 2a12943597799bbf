//! Slot generation and availability filtering.
//!
//! Both functions are pure. Provider hours are local wall-clock times; slots
//! are produced in UTC using the provider's fixed offset.

use crate::types::{Booking, Provider, Service, TimeSlot};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Generate candidate slots for every open day in `[start_date, end_date]`.
///
/// Each open day yields back-to-back intervals of the service duration starting
/// at the opening time. An interval that would end after closing time is
/// dropped. Closed days, a non-positive duration or `close <= open` yield
/// nothing for that day, and `end_date < start_date` yields nothing at all.
#[must_use]
pub fn generate_slots(
    provider: &Provider,
    service: &Service,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Vec<TimeSlot> {
    let mut slots = Vec::new();
    if service.duration_minutes == 0 {
        return slots;
    }
    let duration = service.duration();

    let mut day = start_date;
    while day <= end_date {
        let hours = provider.hours.for_day(day.weekday());
        if hours.is_open && hours.close > hours.open {
            let close = day.and_time(hours.close);
            let mut cursor = day.and_time(hours.open);
            while cursor + duration <= close {
                let start = to_utc(provider, cursor);
                slots.push(TimeSlot {
                    provider_id: provider.id.clone(),
                    service_id: service.id.clone(),
                    start,
                    end: start + duration,
                    available: true,
                });
                cursor += duration;
            }
        }

        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    slots
}

/// Half-open interval intersection: touching intervals do not overlap.
#[must_use]
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

/// Keep the candidates no active booking for the same provider and service overlaps.
///
/// Cancelled and rescheduled bookings, and bookings of other providers or
/// services, are ignored.
#[must_use]
pub fn filter_available(candidates: Vec<TimeSlot>, bookings: &[Booking]) -> Vec<TimeSlot> {
    candidates
        .into_iter()
        .filter(|slot| !is_taken(slot, bookings))
        .collect()
}

/// Like [`filter_available`], but keeps every candidate and sets its `available` flag.
#[must_use]
pub fn mark_availability(candidates: Vec<TimeSlot>, bookings: &[Booking]) -> Vec<TimeSlot> {
    candidates
        .into_iter()
        .map(|mut slot| {
            slot.available = !is_taken(&slot, bookings);
            slot
        })
        .collect()
}

/// The generated slot starting exactly at `start`, if there is one.
///
/// Used to reject booking requests that do not sit on the provider's grid.
#[must_use]
pub fn slot_on_grid(
    provider: &Provider,
    service: &Service,
    start: DateTime<Utc>,
) -> Option<TimeSlot> {
    let day = local_date(provider, start);
    generate_slots(provider, service, day, day)
        .into_iter()
        .find(|slot| slot.start == start)
}

/// Calendar date of `instant` in the provider's local time
#[must_use]
pub fn local_date(provider: &Provider, instant: DateTime<Utc>) -> NaiveDate {
    (instant.naive_utc() + offset(provider)).date()
}

fn is_taken(slot: &TimeSlot, bookings: &[Booking]) -> bool {
    bookings
        .iter()
        .any(|booking| booking.blocks(&slot.provider_id, &slot.service_id, slot.start, slot.end))
}

fn offset(provider: &Provider) -> Duration {
    Duration::minutes(i64::from(provider.utc_offset_minutes))
}

fn to_utc(provider: &Provider, local: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local - offset(provider)))
}
