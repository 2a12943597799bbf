//! End-to-end booking lifecycle through `BookingService`.
//!
//! Run with: `cargo test --test booking_flow_test`

#![allow(clippy::unwrap_used)]

mod common;

use careslot_scheduling::notifications::SentNotification;
use careslot_scheduling::{
    BookingError, BookingFilter, BookingStatus, CancellationActor, Money, PaymentStatus,
    ReminderStatus,
};
use chrono::Duration;
use common::{
    CONSULT, DEPOSIT_CENTS, Harness, LATE_FEE_CENTS, NO_SHOW_FEE_CENTS, OTHER_PATIENT, PATIENT,
    PROVIDER, THERAPY, at, monday,
};

#[tokio::test]
async fn test_open_weekday_yields_sixteen_half_hour_slots() {
    let harness = Harness::new().await;

    let slots = harness
        .service
        .available_slots(&PROVIDER.into(), &CONSULT.into(), monday(), monday())
        .await
        .unwrap();

    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0].start, at(0, 9, 0));
    assert_eq!(slots[15].end, at(0, 17, 0));
    assert!(slots.iter().all(|s| s.available && s.end - s.start == Duration::minutes(30)));

    // Saturday and Sunday are closed
    let weekend = harness
        .service
        .available_slots(
            &PROVIDER.into(),
            &CONSULT.into(),
            monday() + Duration::days(5),
            monday() + Duration::days(6),
        )
        .await
        .unwrap();
    assert!(weekend.is_empty());
}

#[tokio::test]
async fn test_booking_without_deposit_confirms_and_takes_slot() {
    careslot_testing::init_test_tracing();
    let harness = Harness::new().await;

    let booking = harness.book_consult(at(0, 10, 0)).await;

    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.payment_status, PaymentStatus::NotRequired);
    assert!(booking.confirmation_sent);
    assert!(booking.reference.starts_with("CS-"));
    assert_eq!(booking.end, at(0, 10, 30));
    assert_eq!(harness.stored(&booking.id).await, booking);
    assert_eq!(
        harness.notifier.sent(),
        vec![SentNotification::Confirmation {
            booking_id: booking.id.clone(),
            user_id: PATIENT.into(),
        }]
    );

    let slots = harness
        .service
        .available_slots(&PROVIDER.into(), &CONSULT.into(), monday(), monday())
        .await
        .unwrap();
    assert_eq!(slots.len(), 15);
    assert!(slots.iter().all(|s| s.start != at(0, 10, 0)));
}

#[tokio::test]
async fn test_second_booking_of_same_slot_is_refused() {
    let harness = Harness::new().await;
    harness.book_consult(at(0, 10, 0)).await;

    let result = harness
        .service
        .create(Harness::request(OTHER_PATIENT, CONSULT, at(0, 10, 0)))
        .await;

    assert_eq!(result, Err(BookingError::SlotUnavailable));
    let active = harness
        .service
        .bookings(&BookingFilter {
            active_only: true,
            ..BookingFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let harness = Harness::new().await;

    let past = harness.service.create(Harness::request(PATIENT, CONSULT, at(0, 7, 0))).await;
    assert!(matches!(past, Err(BookingError::PolicyViolation(_))));

    let off_grid = harness.service.create(Harness::request(PATIENT, CONSULT, at(0, 10, 15))).await;
    assert!(matches!(off_grid, Err(BookingError::PolicyViolation(_))));

    let after_close =
        harness.service.create(Harness::request(PATIENT, CONSULT, at(0, 17, 0))).await;
    assert!(matches!(after_close, Err(BookingError::PolicyViolation(_))));

    let unknown_user =
        harness.service.create(Harness::request("user-nobody", CONSULT, at(0, 10, 0))).await;
    assert!(matches!(unknown_user, Err(BookingError::NotFound { entity: "user", .. })));

    let unknown_service =
        harness.service.create(Harness::request(PATIENT, "svc-none", at(0, 10, 0))).await;
    assert!(matches!(unknown_service, Err(BookingError::NotFound { entity: "service", .. })));

    assert!(harness.service.bookings(&BookingFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deposit_booking_waits_for_payment() {
    let harness = Harness::new().await;

    let pending = harness
        .service
        .create(Harness::request(PATIENT, THERAPY, at(1, 10, 0)))
        .await
        .unwrap();

    assert_eq!(pending.status, BookingStatus::Pending);
    assert_eq!(pending.payment_status, PaymentStatus::AwaitingDeposit);
    assert_eq!(pending.deposit_amount, Money::from_cents(DEPOSIT_CENTS));
    assert!(pending.payment_intent_id.is_some());
    assert_eq!(harness.stored(&pending.id).await.payment_intent_id, pending.payment_intent_id);
    assert!(harness.notifier.sent().is_empty());

    // Manual confirmation is refused while the deposit is outstanding
    assert_eq!(
        harness.service.confirm(&pending.id).await,
        Err(BookingError::PaymentRequired)
    );

    let intent_id = pending.payment_intent_id.clone().unwrap();
    let confirmed = harness.service.on_payment_result(&intent_id, true).await.unwrap();

    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.payment_status, PaymentStatus::Paid);
    assert_eq!(confirmed.deposit_paid, Money::from_cents(DEPOSIT_CENTS));
    assert!(confirmed.confirmation_sent);
    assert_eq!(harness.stored(&pending.id).await, confirmed);

    // A duplicate notification changes nothing
    let again = harness.service.on_payment_result(&intent_id, true).await.unwrap();
    assert_eq!(again, confirmed);
}

#[tokio::test]
async fn test_failed_deposit_cancels_without_fee() {
    let harness = Harness::new().await;
    let pending = harness
        .service
        .create(Harness::request(PATIENT, THERAPY, at(1, 10, 0)))
        .await
        .unwrap();

    let intent_id = pending.payment_intent_id.clone().unwrap();
    let cancelled = harness.service.on_payment_result(&intent_id, false).await.unwrap();

    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::Failed);
    assert_eq!(cancelled.fee_charged, Money::ZERO);
    assert_eq!(cancelled.cancellation.as_ref().unwrap().actor, CancellationActor::System);
    assert!(harness.gateway.refunds().is_empty());

    // The slot is free again
    harness
        .service
        .create(Harness::request(OTHER_PATIENT, THERAPY, at(1, 10, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_payment_intent_is_not_found() {
    let harness = Harness::new().await;

    let result = harness.service.on_payment_result(&"pi_unknown".into(), true).await;

    assert!(matches!(result, Err(BookingError::NotFound { entity: "payment intent", .. })));
}

#[tokio::test]
async fn test_deposit_intent_failure_is_compensated() {
    let harness = Harness::new().await;
    harness.gateway.fail_intents(true);

    let result = harness
        .service
        .create(Harness::request(PATIENT, THERAPY, at(1, 10, 0)))
        .await;

    assert!(matches!(result, Err(BookingError::UpstreamFailure(_))));
    let all = harness.service.bookings(&BookingFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, BookingStatus::Cancelled);
    assert_eq!(all[0].fee_charged, Money::ZERO);
    assert_eq!(all[0].cancellation.as_ref().unwrap().actor, CancellationActor::System);

    harness.gateway.fail_intents(false);
    harness
        .service
        .create(Harness::request(PATIENT, THERAPY, at(1, 10, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_late_patient_cancellation_charges_fee_and_refunds_rest() {
    let harness = Harness::new().await;
    // Six hours ahead, inside the 24-hour window
    let paid = harness.book_paid_therapy(at(0, 14, 0)).await;

    let cancelled = harness
        .service
        .cancel(&paid.id, "Feeling better", CancellationActor::User)
        .await
        .unwrap();

    let expected_refund = Money::from_cents(DEPOSIT_CENTS - LATE_FEE_CENTS);
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.fee_charged, Money::from_cents(LATE_FEE_CENTS));
    assert_eq!(cancelled.refund_due, expected_refund);
    assert_eq!(cancelled.payment_status, PaymentStatus::Refunded);
    assert_eq!(cancelled.cancellation.as_ref().unwrap().reason, "Feeling better");
    assert_eq!(
        harness.gateway.refunds(),
        vec![(paid.payment_intent_id.clone().unwrap(), expected_refund)]
    );
    assert_eq!(harness.stored(&paid.id).await, cancelled);
}

#[tokio::test]
async fn test_early_cancellation_is_free_whoever_cancels() {
    let harness = Harness::new().await;
    let by_patient = harness.book_paid_therapy(at(3, 10, 0)).await;
    let by_provider = harness.book_paid_therapy(at(3, 11, 0)).await;

    let by_patient = harness
        .service
        .cancel(&by_patient.id, "Conflict", CancellationActor::User)
        .await
        .unwrap();
    assert_eq!(by_patient.fee_charged, Money::ZERO);
    assert_eq!(by_patient.refund_due, Money::from_cents(DEPOSIT_CENTS));

    let by_provider = harness
        .service
        .cancel(&by_provider.id, "Practitioner away", CancellationActor::Provider)
        .await
        .unwrap();
    assert_eq!(by_provider.fee_charged, Money::ZERO);
    assert_eq!(by_provider.refund_due, Money::from_cents(DEPOSIT_CENTS));
    assert_eq!(harness.gateway.refunds().len(), 2);
}

#[tokio::test]
async fn test_late_provider_cancellation_applies_policy_fee() {
    let harness = Harness::new().await;
    let late = harness.book_paid_therapy(at(0, 16, 0)).await;

    let cancelled = harness
        .service
        .cancel(&late.id, "Practitioner unwell", CancellationActor::Provider)
        .await
        .unwrap();

    assert_eq!(cancelled.fee_charged, Money::from_cents(LATE_FEE_CENTS));
    assert_eq!(cancelled.refund_due, Money::from_cents(DEPOSIT_CENTS - LATE_FEE_CENTS));
    assert_eq!(cancelled.cancellation.as_ref().unwrap().actor, CancellationActor::Provider);
    assert_eq!(
        harness.gateway.refunds(),
        vec![(
            late.payment_intent_id.clone().unwrap(),
            Money::from_cents(DEPOSIT_CENTS - LATE_FEE_CENTS)
        )]
    );
}

#[tokio::test]
async fn test_deposit_captured_after_cancellation_is_refunded() {
    let harness = Harness::new().await;
    let pending = harness
        .service
        .create(Harness::request(PATIENT, THERAPY, at(0, 15, 0)))
        .await
        .unwrap();
    let intent_id = pending.payment_intent_id.clone().unwrap();

    let cancelled = harness
        .service
        .cancel(&pending.id, "Found another clinic", CancellationActor::User)
        .await
        .unwrap();
    assert_eq!(cancelled.refund_due, Money::ZERO);
    assert!(harness.gateway.refunds().is_empty());

    // The gateway settles the intent after all
    let settled = harness.service.on_payment_result(&intent_id, true).await.unwrap();

    assert_eq!(settled.status, BookingStatus::Cancelled);
    assert_eq!(settled.deposit_paid, Money::from_cents(DEPOSIT_CENTS));
    assert_eq!(settled.refund_due, Money::from_cents(DEPOSIT_CENTS));
    assert_eq!(settled.payment_status, PaymentStatus::Refunded);
    assert_eq!(
        harness.gateway.refunds(),
        vec![(intent_id.clone(), Money::from_cents(DEPOSIT_CENTS))]
    );
    assert_eq!(harness.stored(&pending.id).await.payment_status, PaymentStatus::Refunded);

    // A duplicate notification refunds nothing more
    harness.service.on_payment_result(&intent_id, true).await.unwrap();
    assert_eq!(harness.gateway.refunds().len(), 1);
}

#[tokio::test]
async fn test_failed_refund_is_flagged_for_follow_up() {
    let harness = Harness::new().await;
    let paid = harness.book_paid_therapy(at(3, 10, 0)).await;
    harness.gateway.fail_refunds(true);

    let cancelled = harness
        .service
        .cancel(&paid.id, "Moving away", CancellationActor::User)
        .await
        .unwrap();

    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::RefundFailed);
    assert_eq!(harness.stored(&paid.id).await.payment_status, PaymentStatus::RefundFailed);
}

#[tokio::test]
async fn test_terminal_bookings_reject_transitions() {
    let harness = Harness::new().await;
    let booking = harness.book_consult(at(2, 10, 0)).await;
    harness
        .service
        .cancel(&booking.id, "Changed plans", CancellationActor::User)
        .await
        .unwrap();

    assert_eq!(
        harness.service.confirm(&booking.id).await,
        Err(BookingError::InvalidTransition {
            from: BookingStatus::Cancelled,
            action: "confirm",
        })
    );
    assert_eq!(
        harness
            .service
            .cancel(&booking.id, "Again", CancellationActor::User)
            .await,
        Err(BookingError::InvalidTransition {
            from: BookingStatus::Cancelled,
            action: "cancel",
        })
    );
    assert!(matches!(
        harness.service.reschedule(&booking.id, at(3, 10, 0)).await,
        Err(BookingError::InvalidTransition { from: BookingStatus::Cancelled, .. })
    ));
    assert!(matches!(
        harness.service.get(&"b-missing".into()).await,
        Err(BookingError::NotFound { entity: "booking", .. })
    ));
}

#[tokio::test]
async fn test_reschedule_moves_booking_and_reminders() {
    let harness = Harness::new().await;
    let original = harness.book_consult(at(2, 10, 0)).await;
    assert_eq!(harness.reminders.for_booking(&original.id).await.unwrap().len(), 2);

    let replacement = harness.service.reschedule(&original.id, at(3, 11, 0)).await.unwrap();

    assert_ne!(replacement.id, original.id);
    assert_eq!(replacement.status, BookingStatus::Confirmed);
    assert_eq!(replacement.start, at(3, 11, 0));
    assert_eq!(replacement.end, at(3, 11, 30));
    assert_eq!(replacement.rescheduled_from, Some(original.id.clone()));
    assert_eq!(replacement.policy, original.policy);

    let old = harness.stored(&original.id).await;
    assert_eq!(old.status, BookingStatus::Rescheduled);
    assert_eq!(old.rescheduled_to, Some(replacement.id.clone()));
    assert_eq!(old.fee_charged, Money::ZERO);

    let old_reminders = harness.reminders.for_booking(&original.id).await.unwrap();
    assert!(old_reminders.iter().all(|r| r.status == ReminderStatus::Cancelled));
    let new_reminders = harness.reminders.for_booking(&replacement.id).await.unwrap();
    assert_eq!(new_reminders.len(), 2);
    assert_eq!(new_reminders[0].scheduled_for, at(2, 11, 0));

    // The old slot is bookable again
    harness
        .service
        .create(Harness::request(OTHER_PATIENT, CONSULT, at(2, 10, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reschedule_keeps_paid_deposit() {
    let harness = Harness::new().await;
    let paid = harness.book_paid_therapy(at(2, 10, 0)).await;

    let replacement = harness.service.reschedule(&paid.id, at(2, 15, 0)).await.unwrap();

    assert_eq!(replacement.status, BookingStatus::Confirmed);
    assert_eq!(replacement.deposit_paid, Money::from_cents(DEPOSIT_CENTS));
    assert_eq!(replacement.payment_intent_id, paid.payment_intent_id);
    assert!(harness.gateway.refunds().is_empty());

    // Payment notifications now resolve to the replacement
    let intent_id = paid.payment_intent_id.clone().unwrap();
    let found = harness.service.on_payment_result(&intent_id, true).await.unwrap();
    assert_eq!(found.id, replacement.id);
}

#[tokio::test]
async fn test_reschedule_rules() {
    let harness = Harness::new().await;
    let soon = harness.book_consult(at(0, 12, 0)).await;
    let later = harness.book_consult(at(2, 10, 0)).await;
    harness.book_consult(at(3, 9, 0)).await;

    // Inside the 24-hour window
    assert!(matches!(
        harness.service.reschedule(&soon.id, at(3, 10, 0)).await,
        Err(BookingError::PolicyViolation(_))
    ));
    // Target taken
    assert_eq!(
        harness.service.reschedule(&later.id, at(3, 9, 0)).await,
        Err(BookingError::SlotUnavailable)
    );
    // Target off the grid
    assert!(matches!(
        harness.service.reschedule(&later.id, at(3, 9, 10)).await,
        Err(BookingError::PolicyViolation(_))
    ));

    assert_eq!(harness.stored(&later.id).await.status, BookingStatus::Confirmed);
    assert_eq!(harness.stored(&soon.id).await.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn test_no_show_and_completion_after_appointment_end() {
    let harness = Harness::new().await;
    let missed = harness.book_paid_therapy(at(0, 10, 0)).await;
    let attended = harness.book_consult(at(0, 11, 0)).await;

    assert!(matches!(
        harness.service.mark_no_show(&missed.id).await,
        Err(BookingError::PolicyViolation(_))
    ));
    assert!(matches!(
        harness.service.complete(&attended.id).await,
        Err(BookingError::PolicyViolation(_))
    ));

    harness.clock.set(at(0, 12, 0));

    let no_show = harness.service.mark_no_show(&missed.id).await.unwrap();
    assert_eq!(no_show.status, BookingStatus::NoShow);
    assert_eq!(no_show.fee_charged, Money::from_cents(NO_SHOW_FEE_CENTS));
    assert_eq!(no_show.refund_due, Money::ZERO);
    assert!(harness.gateway.refunds().is_empty());

    let completed = harness.service.complete(&attended.id).await.unwrap();
    assert_eq!(completed.status, BookingStatus::Completed);
    assert_eq!(
        harness.service.complete(&attended.id).await,
        Err(BookingError::InvalidTransition {
            from: BookingStatus::Completed,
            action: "complete",
        })
    );

    // Past bookings still occupy their interval
    let slots = harness
        .service
        .available_slots(&PROVIDER.into(), &CONSULT.into(), monday(), monday())
        .await
        .unwrap();
    assert!(slots.iter().all(|s| s.start != at(0, 11, 0)));
}
