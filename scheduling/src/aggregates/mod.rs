//! Aggregate reducers for the scheduling engine.
//!
//! - Booking: lifecycle state machine, fees, and the side effects each
//!   transition asks for (deposit intent, confirmation, reminders, refunds)

pub mod booking;

pub use booking::{BookingAction, BookingEnvironment, BookingReducer, BookingState};
