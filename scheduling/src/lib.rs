//! # Careslot Scheduling
//!
//! Appointment scheduling and booking engine for a healthcare-service marketplace.
//!
//! Leaf-first, the engine is made of:
//!
//! - **Slot generation** ([`slots::generate_slots`]): provider hours and service
//!   duration become candidate appointment slots
//! - **Availability** ([`slots::filter_available`]): drops candidates that overlap
//!   an active booking
//! - **Slot locks** ([`lock::SlotLockManager`]): short-lived exclusive claims used
//!   during checkout
//! - **Cancellation policy** ([`policy`]): fee and refund arithmetic
//! - **Booking lifecycle** ([`aggregates::booking::BookingReducer`] driven by
//!   [`app::BookingService`]): every transition is reduced, persisted with a
//!   compare-and-set, then its effects run
//! - **Reminders** ([`reminders::ReminderScheduler`] and
//!   [`dispatcher::ReminderDispatcher`]): durable reminder rows and the periodic
//!   task that sends them
//!
//! Persistence goes through [`store::BookingStore`], with an in-memory
//! implementation for tests and a `PostgreSQL` one for production.

pub mod aggregates;
pub mod app;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod notifications;
pub mod payment_gateway;
pub mod policy;
pub mod reminders;
pub mod slots;
pub mod store;
pub mod types;

pub use aggregates::booking::{BookingAction, BookingEnvironment, BookingReducer, BookingState};
pub use app::BookingService;
pub use config::Config;
pub use dispatcher::{DispatchReport, ReminderDispatcher};
pub use error::{BookingError, StoreError};
pub use lock::SlotLockManager;
pub use notifications::{
    InMemoryDirectory, LoggingNotifier, Notifier, Recipient, RecordingNotifier, UserDirectory,
};
pub use payment_gateway::{MockPaymentGateway, PaymentGateway, PaymentGatewayError};
pub use reminders::ReminderScheduler;
pub use store::{BookingFilter, BookingStore, InMemoryStore, PostgresBookingStore};
pub use types::*;
