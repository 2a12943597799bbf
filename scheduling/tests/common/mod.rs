//! Shared fixtures for the scheduling integration tests.
//!
//! The clinic is open Monday to Friday, 09:00-17:00 UTC. The test clock starts
//! at Monday 2025-01-06 08:00 UTC, one hour before opening.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

pub mod contract;

use careslot_core::environment::Clock;
use careslot_runtime::RetryPolicy;
use careslot_scheduling::{
    Booking, BookingEnvironment, BookingId, BookingRequest, BookingService, BookingStatus,
    BookingStore, CancellationPolicy, DayHours, HolderId, InMemoryDirectory, InMemoryStore,
    MockPaymentGateway, Money, PaymentStatus, PolicySnapshot, Provider, Recipient,
    RecordingNotifier, ReminderDispatcher, ReminderFlags, ReminderScheduler, Service, ServiceId,
    UserId, WeeklyHours,
};
use careslot_testing::{MutableClock, test_epoch};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use std::sync::Arc;

pub const PROVIDER: &str = "prov-harbour";
/// 30 minutes, $100, no deposit
pub const CONSULT: &str = "svc-consult";
/// 30 minutes, $200, 25% deposit
pub const THERAPY: &str = "svc-therapy";
pub const PATIENT: &str = "user-ada";
pub const OTHER_PATIENT: &str = "user-grace";

pub const LATE_FEE_CENTS: u64 = 2_500;
pub const NO_SHOW_FEE_CENTS: u64 = 5_000;
pub const DEPOSIT_CENTS: u64 = 5_000;

/// `days` after the test epoch's date, at `hour:minute` UTC
pub fn at(days: i64, hour: u32, minute: u32) -> DateTime<Utc> {
    let date = monday() + Duration::days(days);
    date.and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap()).and_utc()
}

pub fn monday() -> NaiveDate {
    test_epoch().date_naive()
}

pub fn provider() -> Provider {
    Provider {
        id: PROVIDER.into(),
        name: "Harbour Physiotherapy".to_string(),
        hours: WeeklyHours::on_days(
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            DayHours::open(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            ),
        ),
        utc_offset_minutes: 0,
        policy: CancellationPolicy {
            cancellation_hours: 24,
            reschedule_hours: 24,
            no_show_fee: Money::from_cents(NO_SHOW_FEE_CENTS),
            late_cancellation_fee: Money::from_cents(LATE_FEE_CENTS),
        },
    }
}

pub fn consult() -> Service {
    Service {
        id: CONSULT.into(),
        provider_id: PROVIDER.into(),
        name: "Initial consultation".to_string(),
        duration_minutes: 30,
        price: Money::from_cents(10_000),
        deposit_required: false,
        deposit_percentage: 0,
        preparation_instructions: None,
        version: 1,
    }
}

pub fn therapy() -> Service {
    Service {
        id: THERAPY.into(),
        provider_id: PROVIDER.into(),
        name: "Manual therapy".to_string(),
        duration_minutes: 30,
        price: Money::from_cents(20_000),
        deposit_required: true,
        deposit_percentage: 25,
        preparation_instructions: Some("Wear loose clothing".to_string()),
        version: 1,
    }
}

/// A bare booking row for store-level tests
pub fn booking_row(
    id: &str,
    service_id: &str,
    start: DateTime<Utc>,
    status: BookingStatus,
) -> Booking {
    Booking {
        id: id.into(),
        reference: format!("CS-{}", id.to_uppercase()),
        user_id: PATIENT.into(),
        provider_id: PROVIDER.into(),
        service_id: service_id.into(),
        start,
        end: start + Duration::minutes(30),
        status,
        policy: PolicySnapshot::capture(&provider().policy, &consult()),
        total_cost: Money::from_cents(10_000),
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

/// Everything a service-level test needs, wired to in-memory collaborators
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub clock: MutableClock,
    pub gateway: MockPaymentGateway,
    pub notifier: RecordingNotifier,
    pub directory: InMemoryDirectory,
    pub reminders: Arc<ReminderScheduler>,
    pub service: BookingService,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.put_provider(&provider()).await.unwrap();
        store.put_service(&consult()).await.unwrap();
        store.put_service(&therapy()).await.unwrap();

        let clock = MutableClock::at(test_epoch());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let gateway = MockPaymentGateway::new();
        let notifier = RecordingNotifier::new();
        let directory = InMemoryDirectory::new()
            .with(Recipient::with_email(PATIENT, "Ada", "ada@example.com"))
            .with(Recipient::with_email(OTHER_PATIENT, "Grace", "grace@example.com"));

        let reminders = Arc::new(ReminderScheduler::new(store.clone(), Arc::clone(&shared_clock)));
        let env = BookingEnvironment::new(
            shared_clock,
            Arc::new(gateway.clone()),
            Arc::new(notifier.clone()),
            Arc::clone(&reminders),
        )
        .with_refund_retry(RetryPolicy::no_retry());
        let service = BookingService::new(store.clone(), Arc::new(directory.clone()), env);

        Self {
            store,
            clock,
            gateway,
            notifier,
            directory,
            reminders,
            service,
        }
    }

    pub fn dispatcher(&self) -> ReminderDispatcher {
        ReminderDispatcher::new(
            Arc::clone(&self.reminders),
            self.store.clone(),
            Arc::new(self.notifier.clone()),
            Arc::new(self.directory.clone()),
            Arc::new(self.clock.clone()),
        )
    }

    pub fn request(user: &str, service_id: &str, start: DateTime<Utc>) -> BookingRequest {
        BookingRequest {
            user_id: UserId::from(user),
            provider_id: PROVIDER.into(),
            service_id: ServiceId::from(service_id),
            start,
            holder: None,
        }
    }

    pub fn request_as(holder: &str, service_id: &str, start: DateTime<Utc>) -> BookingRequest {
        BookingRequest {
            holder: Some(HolderId::from(holder)),
            ..Self::request(PATIENT, service_id, start)
        }
    }

    /// Book a consultation for the default patient
    pub async fn book_consult(&self, start: DateTime<Utc>) -> Booking {
        self.service.create(Self::request(PATIENT, CONSULT, start)).await.unwrap()
    }

    /// Book a therapy session and pay its deposit
    pub async fn book_paid_therapy(&self, start: DateTime<Utc>) -> Booking {
        let pending = self.service.create(Self::request(PATIENT, THERAPY, start)).await.unwrap();
        let intent_id = pending.payment_intent_id.clone().unwrap();
        self.service.on_payment_result(&intent_id, true).await.unwrap()
    }

    pub async fn stored(&self, id: &BookingId) -> Booking {
        self.store.get_booking(id).await.unwrap().unwrap()
    }
}
