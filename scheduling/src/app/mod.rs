//! Application layer - runs reducer commands against the store.
//!
//! [`BookingService`] is the entry point callers use: it loads bookings,
//! reduces a command, persists the result with an atomic conditional write,
//! then executes the effects and persists what they feed back.

mod service;

pub use service::BookingService;
