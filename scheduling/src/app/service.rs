//! Booking service - command handler for the booking lifecycle.
//!
//! Every operation follows the same steps:
//! 1. Load the booking (and provider/service where needed)
//! 2. Reduce the command; a rejected command persists nothing
//! 3. Persist with a conditional write (`insert_booking`, CAS `update_booking`,
//!    or `reschedule_booking`)
//! 4. Execute effects, reduce their feedback, persist again

use crate::aggregates::booking::{BookingAction, BookingEnvironment, BookingReducer, BookingState};
use crate::error::{BookingError, StoreError};
use crate::metrics;
use crate::notifications::UserDirectory;
use crate::slots;
use crate::store::{BookingFilter, BookingStore};
use crate::types::{
    Booking, BookingId, BookingRequest, BookingStatus, CancellationActor, Money, PaymentIntentId,
    PaymentStatus, PolicySnapshot, Provider, ProviderId, ReminderFlags, Service, ServiceId,
    TimeSlot, generate_reference,
};
use careslot_core::effect::Effect;
use careslot_core::reducer::Reducer;
use careslot_runtime::execute_effects;
use chrono::{DateTime, NaiveDate, Utc};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on effect/feedback rounds per operation
const MAX_SETTLE_ROUNDS: usize = 8;

/// Booking lifecycle service
#[derive(Clone)]
pub struct BookingService {
    store: Arc<dyn BookingStore>,
    directory: Arc<dyn UserDirectory>,
    reducer: BookingReducer,
    env: BookingEnvironment,
}

impl BookingService {
    /// Create a new booking service
    #[must_use]
    pub fn new(
        store: Arc<dyn BookingStore>,
        directory: Arc<dyn UserDirectory>,
        env: BookingEnvironment,
    ) -> Self {
        Self {
            store,
            directory,
            reducer: BookingReducer::new(),
            env,
        }
    }

    /// The reducer environment (clock, collaborators)
    #[must_use]
    pub const fn environment(&self) -> &BookingEnvironment {
        &self.env
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Free slots of a service between two local dates (inclusive).
    ///
    /// # Errors
    ///
    /// - [`BookingError::NotFound`] if the provider or service is missing
    /// - [`BookingError::PolicyViolation`] if the service belongs to another provider
    /// - [`BookingError::Storage`] on store failure
    pub async fn available_slots(
        &self,
        provider_id: &ProviderId,
        service_id: &ServiceId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, BookingError> {
        let (provider, service) = self.load_offering(provider_id, service_id).await?;
        let candidates = slots::generate_slots(&provider, &service, start_date, end_date);
        let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
            return Ok(Vec::new());
        };

        let bookings = self
            .store
            .list_bookings(&BookingFilter::active_between(
                provider_id,
                service_id,
                first.start,
                last.end,
            ))
            .await?;
        Ok(slots::filter_available(candidates, &bookings))
    }

    /// Booking by ID
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] if missing, [`BookingError::Storage`] on store failure.
    pub async fn get(&self, booking_id: &BookingId) -> Result<Booking, BookingError> {
        self.load(booking_id).await
    }

    /// Bookings matching `filter`, ordered by start
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Storage`] on store failure.
    pub async fn bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, BookingError> {
        Ok(self.store.list_bookings(filter).await?)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Create a booking.
    ///
    /// Confirms immediately when no deposit is required; otherwise the booking
    /// stays `Pending` until [`Self::on_payment_result`] reports the deposit.
    ///
    /// # Errors
    ///
    /// - [`BookingError::NotFound`] for an unknown user, provider or service
    /// - [`BookingError::PolicyViolation`] if the start is in the past, off the
    ///   slot grid, or the service belongs to another provider
    /// - [`BookingError::SlotUnavailable`] if the slot is booked or locked by
    ///   another holder
    /// - [`BookingError::UpstreamFailure`] if the deposit intent could not be
    ///   opened (the booking is then cancelled without fee)
    #[tracing::instrument(
        skip_all,
        fields(
            user = %request.user_id,
            provider = %request.provider_id,
            service = %request.service_id,
            start = %request.start
        )
    )]
    pub async fn create(&self, request: BookingRequest) -> Result<Booking, BookingError> {
        let recipient = self
            .directory
            .recipient(&request.user_id)
            .await
            .ok_or_else(|| BookingError::not_found("user", &request.user_id))?;
        let (provider, service) =
            self.load_offering(&request.provider_id, &request.service_id).await?;

        let now = self.env.clock.now();
        let slot = Self::validate_start(&provider, &service, request.start, now)?;
        self.ensure_available(&slot, None).await?;

        let booking = Self::new_booking(&request, &provider, &service, slot.end, now);
        let booking_id = booking.id.clone();

        let mut state = BookingState::new();
        let effects = self.reducer.reduce(
            &mut state,
            BookingAction::Place {
                booking: Box::new(booking),
                recipient: Some(recipient),
            },
            &self.env,
        );
        Self::check(&state)?;

        let placed = Self::booking_in(&state, &booking_id)?;
        match self.store.insert_booking(&placed, request.holder.as_ref(), now).await {
            Ok(()) => {},
            Err(StoreError::Conflict) => {
                metrics::record_slot_conflict("booking");
                tracing::info!("Slot taken by a concurrent booking");
                return Err(BookingError::SlotUnavailable);
            },
            Err(error) => return Err(error.into()),
        }
        metrics::record_booking_status(placed.status);
        tracing::info!(
            booking_id = %placed.id,
            reference = %placed.reference,
            status = %placed.status,
            "Booking created"
        );

        let feedback = self.settle(&mut state, effects).await;
        let intent_failure = feedback.iter().find_map(|action| match action {
            BookingAction::DepositIntentFailed { error, .. } => Some(error.clone()),
            _ => None,
        });
        if let Some(error) = intent_failure {
            return Err(BookingError::UpstreamFailure(format!("deposit intent: {error}")));
        }

        Self::booking_in(&state, &booking_id)
    }

    /// Confirm a pending booking.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidTransition`] unless pending,
    /// [`BookingError::PaymentRequired`] while a deposit is outstanding.
    #[tracing::instrument(skip_all, fields(booking_id = %booking_id))]
    pub async fn confirm(&self, booking_id: &BookingId) -> Result<Booking, BookingError> {
        let stored = self.load(booking_id).await?;
        let recipient = self.directory.recipient(&stored.user_id).await;
        let action = BookingAction::Confirm {
            booking_id: booking_id.clone(),
            recipient,
        };
        self.apply(stored, action, "confirm").await
    }

    /// Cancel a pending or confirmed booking.
    ///
    /// Patient cancellations pay the policy's late fee inside the cancellation
    /// window; provider and system cancellations are free. Any refund owed on
    /// a paid deposit is requested from the gateway.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidTransition`] from any other state.
    #[tracing::instrument(skip_all, fields(booking_id = %booking_id, actor = actor.as_str()))]
    pub async fn cancel(
        &self,
        booking_id: &BookingId,
        reason: impl Into<String>,
        actor: CancellationActor,
    ) -> Result<Booking, BookingError> {
        let stored = self.load(booking_id).await?;
        let action = BookingAction::Cancel {
            booking_id: booking_id.clone(),
            reason: reason.into(),
            actor,
        };
        self.apply(stored, action, "cancel").await
    }

    /// Record a no-show once the appointment has ended.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidTransition`] unless confirmed,
    /// [`BookingError::PolicyViolation`] before the end time.
    #[tracing::instrument(skip_all, fields(booking_id = %booking_id))]
    pub async fn mark_no_show(&self, booking_id: &BookingId) -> Result<Booking, BookingError> {
        let stored = self.load(booking_id).await?;
        let action = BookingAction::MarkNoShow {
            booking_id: booking_id.clone(),
        };
        self.apply(stored, action, "record a no-show for").await
    }

    /// Record attendance once the appointment has ended.
    ///
    /// # Errors
    ///
    /// [`BookingError::InvalidTransition`] unless confirmed,
    /// [`BookingError::PolicyViolation`] before the end time.
    #[tracing::instrument(skip_all, fields(booking_id = %booking_id))]
    pub async fn complete(&self, booking_id: &BookingId) -> Result<Booking, BookingError> {
        let stored = self.load(booking_id).await?;
        let action = BookingAction::Complete {
            booking_id: booking_id.clone(),
        };
        self.apply(stored, action, "complete").await
    }

    /// Move a booking to `new_start`. Returns the replacement booking.
    ///
    /// The old booking becomes `Rescheduled` without fee and points at the
    /// replacement, which keeps the original terms, duration and deposit.
    ///
    /// # Errors
    ///
    /// - [`BookingError::InvalidTransition`] unless pending or confirmed
    /// - [`BookingError::PolicyViolation`] inside the reschedule window, or if
    ///   the new start is in the past or off the slot grid
    /// - [`BookingError::SlotUnavailable`] if the new slot is taken
    #[tracing::instrument(skip_all, fields(booking_id = %booking_id, new_start = %new_start))]
    pub async fn reschedule(
        &self,
        booking_id: &BookingId,
        new_start: DateTime<Utc>,
    ) -> Result<Booking, BookingError> {
        let stored = self.load(booking_id).await?;
        let (provider, service) =
            self.load_offering(&stored.provider_id, &stored.service_id).await?;
        let now = self.env.clock.now();

        let replacement = Self::replacement_for(&stored, new_start, now);
        let replacement_id = replacement.id.clone();
        let recipient = self.directory.recipient(&stored.user_id).await;

        let mut state = BookingState::with_booking(stored.clone());
        let effects = self.reducer.reduce(
            &mut state,
            BookingAction::Reschedule {
                booking_id: booking_id.clone(),
                replacement: Box::new(replacement),
                recipient,
            },
            &self.env,
        );
        Self::check(&state)?;

        Self::validate_start(&provider, &service, new_start, now)?;
        let old = Self::booking_in(&state, booking_id)?;
        let created = Self::booking_in(&state, &replacement_id)?;
        let target = TimeSlot {
            provider_id: created.provider_id.clone(),
            service_id: created.service_id.clone(),
            start: created.start,
            end: created.end,
            available: true,
        };
        self.ensure_available(&target, Some(booking_id)).await?;

        match self.store.reschedule_booking(&old, stored.status, &created, now).await {
            Ok(()) => {},
            Err(StoreError::Conflict) => {
                let current = self.load(booking_id).await?;
                if current.status != stored.status {
                    return Err(BookingError::InvalidTransition {
                        from: current.status,
                        action: "reschedule",
                    });
                }
                metrics::record_slot_conflict("reschedule");
                return Err(BookingError::SlotUnavailable);
            },
            Err(error) => return Err(error.into()),
        }
        metrics::record_booking_status(BookingStatus::Rescheduled);
        metrics::record_booking_status(created.status);
        tracing::info!(
            replacement_id = %created.id,
            reference = %created.reference,
            status = %created.status,
            "Booking rescheduled"
        );

        self.settle(&mut state, effects).await;
        Self::booking_in(&state, &replacement_id)
    }

    /// Asynchronous deposit result from the payment collaborator.
    ///
    /// Success confirms the booking; failure cancels it without fee. Results
    /// for bookings no longer awaiting a deposit are ignored and the booking
    /// is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`BookingError::NotFound`] if no booking carries the intent.
    #[tracing::instrument(skip_all, fields(intent_id = %intent_id, success = success))]
    pub async fn on_payment_result(
        &self,
        intent_id: &PaymentIntentId,
        success: bool,
    ) -> Result<Booking, BookingError> {
        let stored = self
            .store
            .find_booking_by_intent(intent_id)
            .await?
            .ok_or_else(|| BookingError::not_found("payment intent", intent_id))?;
        let recipient = if success {
            self.directory.recipient(&stored.user_id).await
        } else {
            None
        };
        let action = BookingAction::RecordPayment {
            booking_id: stored.id.clone(),
            success,
            recipient,
        };
        self.apply(stored, action, "record a payment for").await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Reduce `action` against `stored`, CAS-persist the result, then settle effects
    async fn apply(
        &self,
        stored: Booking,
        action: BookingAction,
        verb: &'static str,
    ) -> Result<Booking, BookingError> {
        let booking_id = stored.id.clone();
        let expected = stored.status;
        let mut state = BookingState::with_booking(stored.clone());

        let effects = self.reducer.reduce(&mut state, action, &self.env);
        Self::check(&state)?;

        let updated = Self::booking_in(&state, &booking_id)?;
        if updated != stored {
            match self.store.update_booking(&updated, expected).await {
                Ok(()) => {},
                Err(StoreError::Conflict) => {
                    let current = self.load(&booking_id).await?;
                    tracing::info!(from = %current.status, "Booking changed concurrently");
                    return Err(BookingError::InvalidTransition {
                        from: current.status,
                        action: verb,
                    });
                },
                Err(error) => return Err(error.into()),
            }
            if updated.status != expected {
                metrics::record_booking_status(updated.status);
            }
            tracing::info!(
                booking_id = %booking_id,
                reference = %updated.reference,
                status = %updated.status,
                fee = %updated.fee_charged,
                refund = %updated.refund_due,
                "Booking updated"
            );
        }

        self.settle(&mut state, effects).await;
        Self::booking_in(&state, &booking_id)
    }

    /// Run effects until no more feedback arrives, persisting after each round.
    ///
    /// Returns every feedback action reduced.
    async fn settle(
        &self,
        state: &mut BookingState,
        effects: SmallVec<[Effect<BookingAction>; 4]>,
    ) -> Vec<BookingAction> {
        let mut reduced = Vec::new();
        let mut pending: Vec<Effect<BookingAction>> = effects.into_vec();

        for _ in 0..MAX_SETTLE_ROUNDS {
            if pending.is_empty() {
                break;
            }
            let feedback = execute_effects(std::mem::take(&mut pending)).await;
            let before = state.bookings.clone();

            for action in feedback {
                tracing::debug!(action = action.name(), "Reducing effect feedback");
                reduced.push(action.clone());
                pending.extend(self.reducer.reduce(state, action, &self.env));
            }
            self.persist_changes(&before, state).await;
        }

        if !pending.is_empty() {
            tracing::warn!(remaining = pending.len(), "Effects still pending after settle limit");
        }
        reduced
    }

    /// Best-effort CAS persistence of bookings changed by feedback
    async fn persist_changes(&self, before: &HashMap<BookingId, Booking>, state: &BookingState) {
        for (booking_id, booking) in &state.bookings {
            let Some(previous) = before.get(booking_id) else {
                continue;
            };
            if previous == booking {
                continue;
            }

            match self.store.update_booking(booking, previous.status).await {
                Ok(()) => {
                    if previous.status != booking.status {
                        metrics::record_booking_status(booking.status);
                        tracing::info!(
                            booking_id = %booking_id,
                            reference = %booking.reference,
                            status = %booking.status,
                            "Booking updated from effect feedback"
                        );
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        booking_id = %booking_id,
                        error = %error,
                        "Effect feedback not persisted"
                    );
                },
            }
        }
    }

    async fn load(&self, booking_id: &BookingId) -> Result<Booking, BookingError> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| BookingError::not_found("booking", booking_id))
    }

    async fn load_offering(
        &self,
        provider_id: &ProviderId,
        service_id: &ServiceId,
    ) -> Result<(Provider, Service), BookingError> {
        let provider = self
            .store
            .get_provider(provider_id)
            .await?
            .ok_or_else(|| BookingError::not_found("provider", provider_id))?;
        let service = self
            .store
            .get_service(service_id)
            .await?
            .ok_or_else(|| BookingError::not_found("service", service_id))?;
        if service.provider_id != provider.id {
            return Err(BookingError::PolicyViolation(format!(
                "service {} is not offered by provider {}",
                service.id, provider.id
            )));
        }
        Ok((provider, service))
    }

    /// Reject past starts and starts off the provider's slot grid
    fn validate_start(
        provider: &Provider,
        service: &Service,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TimeSlot, BookingError> {
        if start <= now {
            return Err(BookingError::PolicyViolation(
                "appointment must start in the future".to_string(),
            ));
        }
        slots::slot_on_grid(provider, service, start).ok_or_else(|| {
            BookingError::PolicyViolation(format!(
                "{start} is not a bookable start for service {}",
                service.id
            ))
        })
    }

    /// Re-run availability against the stored bookings, ignoring `exclude`
    async fn ensure_available(
        &self,
        slot: &TimeSlot,
        exclude: Option<&BookingId>,
    ) -> Result<(), BookingError> {
        let mut bookings = self
            .store
            .list_bookings(&BookingFilter::active_between(
                &slot.provider_id,
                &slot.service_id,
                slot.start,
                slot.end,
            ))
            .await?;
        bookings.retain(|booking| Some(&booking.id) != exclude);

        if slots::filter_available(vec![slot.clone()], &bookings).is_empty() {
            metrics::record_slot_conflict("availability");
            return Err(BookingError::SlotUnavailable);
        }
        Ok(())
    }

    fn check(state: &BookingState) -> Result<(), BookingError> {
        match &state.last_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn booking_in(state: &BookingState, booking_id: &BookingId) -> Result<Booking, BookingError> {
        state
            .get(booking_id)
            .cloned()
            .ok_or_else(|| BookingError::not_found("booking", booking_id))
    }

    fn new_booking(
        request: &BookingRequest,
        provider: &Provider,
        service: &Service,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Booking {
        Booking {
            id: BookingId::generate(),
            reference: generate_reference(),
            user_id: request.user_id.clone(),
            provider_id: provider.id.clone(),
            service_id: service.id.clone(),
            start: request.start,
            end,
            status: BookingStatus::Pending,
            policy: PolicySnapshot::capture(&provider.policy, service),
            total_cost: service.price,
            deposit_amount: service.deposit_amount(),
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
            created_at: now,
            updated_at: now,
        }
    }

    /// New pending booking at `start` carrying the terms, duration and payment of `old`
    fn replacement_for(old: &Booking, start: DateTime<Utc>, now: DateTime<Utc>) -> Booking {
        Booking {
            id: BookingId::generate(),
            reference: generate_reference(),
            start,
            end: start + (old.end - old.start),
            status: BookingStatus::Pending,
            confirmation_sent: false,
            reminders_sent: ReminderFlags::default(),
            cancellation: None,
            fee_charged: Money::ZERO,
            refund_due: Money::ZERO,
            rescheduled_to: None,
            rescheduled_from: Some(old.id.clone()),
            created_at: now,
            updated_at: now,
            ..old.clone()
        }
    }
}
