//! Booking lifecycle reducer.
//!
//! Commands are validated against the current state and turned into events;
//! events are the only thing that mutates a booking. Effects describe the
//! collaborator calls a transition needs (deposit intent, confirmation,
//! reminders, refund) and feed their outcome back as actions.
//!
//! ```text
//! Pending ──confirm──▶ Confirmed ──complete──▶ Completed
//!    │                    ├──no-show──▶ NoShow
//!    ├──cancel────────────┴──cancel───▶ Cancelled
//!    └──reschedule (from either)──────▶ Rescheduled + new booking
//! ```

use crate::error::BookingError;
use crate::notifications::{Notifier, Recipient};
use crate::payment_gateway::PaymentGateway;
use crate::policy;
use crate::reminders::ReminderScheduler;
use crate::types::{
    Booking, BookingId, BookingStatus, Cancellation, CancellationActor, CancellationOutcome,
    Money, PaymentIntentId, PaymentStatus,
};
use careslot_core::{effect::Effect, environment::Clock, reducer::Reducer, smallvec, SmallVec};
use careslot_runtime::{RetryPolicy, retry_with_backoff};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Actions (Commands + Events + Feedback)
// ============================================================================

/// Actions for the booking lifecycle
#[derive(Clone, Debug)]
pub enum BookingAction {
    // Commands
    /// Record a new booking. Confirms it at once unless a deposit is outstanding.
    Place {
        /// Booking built by the service, status `Pending`
        booking: Box<Booking>,
        /// Confirmation recipient
        recipient: Option<Recipient>,
    },

    /// Confirm a pending booking
    Confirm {
        /// Booking ID
        booking_id: BookingId,
        /// Confirmation recipient
        recipient: Option<Recipient>,
    },

    /// Cancel a pending or confirmed booking
    Cancel {
        /// Booking ID
        booking_id: BookingId,
        /// Free-text reason
        reason: String,
        /// Who asked
        actor: CancellationActor,
    },

    /// Record that the patient did not attend
    MarkNoShow {
        /// Booking ID
        booking_id: BookingId,
    },

    /// Record that the appointment took place
    Complete {
        /// Booking ID
        booking_id: BookingId,
    },

    /// Move a booking to a new slot
    Reschedule {
        /// Booking being replaced
        booking_id: BookingId,
        /// New booking, status `Pending`, carrying the old terms
        replacement: Box<Booking>,
        /// Confirmation recipient
        recipient: Option<Recipient>,
    },

    /// Deposit settlement reported by the payment collaborator
    RecordPayment {
        /// Booking ID
        booking_id: BookingId,
        /// Whether the deposit was captured
        success: bool,
        /// Confirmation recipient
        recipient: Option<Recipient>,
    },

    // Events
    /// A booking was recorded
    BookingPlaced {
        /// The booking as stored
        booking: Box<Booking>,
    },

    /// A booking was confirmed
    BookingConfirmed {
        /// Booking ID
        booking_id: BookingId,
        /// When
        confirmed_at: DateTime<Utc>,
    },

    /// A booking was cancelled
    BookingCancelled {
        /// Booking ID
        booking_id: BookingId,
        /// Reason, actor and time
        cancellation: Cancellation,
        /// Fee and refund
        outcome: CancellationOutcome,
    },

    /// The patient did not attend
    BookingNoShow {
        /// Booking ID
        booking_id: BookingId,
        /// Fee and refund
        outcome: CancellationOutcome,
        /// When recorded
        recorded_at: DateTime<Utc>,
    },

    /// The appointment took place
    BookingCompleted {
        /// Booking ID
        booking_id: BookingId,
        /// When recorded
        completed_at: DateTime<Utc>,
    },

    /// A booking was replaced by another
    BookingRescheduled {
        /// Booking ID
        booking_id: BookingId,
        /// Replacement booking
        replacement_id: BookingId,
        /// When
        rescheduled_at: DateTime<Utc>,
    },

    /// The deposit was captured
    DepositPaid {
        /// Booking ID
        booking_id: BookingId,
        /// Amount captured
        amount: Money,
        /// When
        paid_at: DateTime<Utc>,
    },

    /// The deposit could not be collected
    DepositFailed {
        /// Booking ID
        booking_id: BookingId,
        /// When
        failed_at: DateTime<Utc>,
    },

    /// The deposit was captured after the booking had been cancelled
    /// and is owed back in full
    LateDepositCaptured {
        /// Booking ID
        booking_id: BookingId,
        /// Amount captured
        amount: Money,
        /// When
        captured_at: DateTime<Utc>,
    },

    /// A command was refused; state is unchanged apart from `last_error`
    TransitionRejected {
        /// Why
        error: BookingError,
    },

    // Effect feedback
    /// The gateway opened a deposit intent
    DepositIntentOpened {
        /// Booking ID
        booking_id: BookingId,
        /// Intent ID
        intent_id: PaymentIntentId,
    },

    /// The gateway refused to open a deposit intent
    DepositIntentFailed {
        /// Booking ID
        booking_id: BookingId,
        /// Gateway error
        error: String,
    },

    /// Confirmation delivered
    ConfirmationSent {
        /// Booking ID
        booking_id: BookingId,
    },

    /// Confirmation could not be delivered
    ConfirmationFailed {
        /// Booking ID
        booking_id: BookingId,
        /// Delivery error
        error: String,
    },

    /// Reminder rows created
    RemindersScheduled {
        /// Booking ID
        booking_id: BookingId,
        /// Rows inserted
        count: usize,
    },

    /// Reminder rows could not be created
    ReminderSchedulingFailed {
        /// Booking ID
        booking_id: BookingId,
        /// Store error
        error: String,
    },

    /// Pending reminders cancelled
    RemindersCancelled {
        /// Booking ID
        booking_id: BookingId,
        /// Rows cancelled
        count: u64,
    },

    /// The gateway accepted a refund
    RefundInitiated {
        /// Booking ID
        booking_id: BookingId,
        /// Processor refund ID
        refund_id: String,
        /// Amount refunded
        amount: Money,
    },

    /// The refund failed after retries
    RefundFailed {
        /// Booking ID
        booking_id: BookingId,
        /// Gateway error
        error: String,
    },
}

impl BookingAction {
    /// Whether this action is a command issued by a caller
    #[must_use]
    pub const fn is_command(&self) -> bool {
        matches!(
            self,
            Self::Place { .. }
                | Self::Confirm { .. }
                | Self::Cancel { .. }
                | Self::MarkNoShow { .. }
                | Self::Complete { .. }
                | Self::Reschedule { .. }
                | Self::RecordPayment { .. }
        )
    }

    /// Short name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Place { .. } => "place",
            Self::Confirm { .. } => "confirm",
            Self::Cancel { .. } => "cancel",
            Self::MarkNoShow { .. } => "mark_no_show",
            Self::Complete { .. } => "complete",
            Self::Reschedule { .. } => "reschedule",
            Self::RecordPayment { .. } => "record_payment",
            Self::BookingPlaced { .. } => "booking_placed",
            Self::BookingConfirmed { .. } => "booking_confirmed",
            Self::BookingCancelled { .. } => "booking_cancelled",
            Self::BookingNoShow { .. } => "booking_no_show",
            Self::BookingCompleted { .. } => "booking_completed",
            Self::BookingRescheduled { .. } => "booking_rescheduled",
            Self::DepositPaid { .. } => "deposit_paid",
            Self::DepositFailed { .. } => "deposit_failed",
            Self::LateDepositCaptured { .. } => "late_deposit_captured",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::DepositIntentOpened { .. } => "deposit_intent_opened",
            Self::DepositIntentFailed { .. } => "deposit_intent_failed",
            Self::ConfirmationSent { .. } => "confirmation_sent",
            Self::ConfirmationFailed { .. } => "confirmation_failed",
            Self::RemindersScheduled { .. } => "reminders_scheduled",
            Self::ReminderSchedulingFailed { .. } => "reminder_scheduling_failed",
            Self::RemindersCancelled { .. } => "reminders_cancelled",
            Self::RefundInitiated { .. } => "refund_initiated",
            Self::RefundFailed { .. } => "refund_failed",
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Bookings loaded for one operation
#[derive(Clone, Debug, Default)]
pub struct BookingState {
    /// Bookings by ID
    pub bookings: HashMap<BookingId, Booking>,
    /// Error of the last rejected command
    pub last_error: Option<BookingError>,
}

impl BookingState {
    /// Empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State holding one booking
    #[must_use]
    pub fn with_booking(booking: Booking) -> Self {
        let mut state = Self::new();
        state.bookings.insert(booking.id.clone(), booking);
        state
    }

    /// Booking by ID
    #[must_use]
    pub fn get(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.get(id)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the booking reducer
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Clock for policy windows and timestamps
    pub clock: Arc<dyn Clock>,
    /// Deposit intents and refunds
    pub gateway: Arc<dyn PaymentGateway>,
    /// Confirmation delivery
    pub notifier: Arc<dyn Notifier>,
    /// Reminder rows
    pub reminders: Arc<ReminderScheduler>,
    /// Currency of deposit intents
    pub currency: String,
    /// Inline retries of refund requests
    pub refund_retry: RetryPolicy,
}

impl BookingEnvironment {
    /// Creates an environment charging in USD with the default refund retry policy
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        reminders: Arc<ReminderScheduler>,
    ) -> Self {
        Self {
            clock,
            gateway,
            notifier,
            reminders,
            currency: "USD".to_string(),
            refund_retry: RetryPolicy::default(),
        }
    }

    /// Override the deposit currency
    #[must_use]
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Override the refund retry policy
    #[must_use]
    pub fn with_refund_retry(mut self, policy: RetryPolicy) -> Self {
        self.refund_retry = policy;
        self
    }
}

// ============================================================================
// Reducer
// ============================================================================

type Effects = SmallVec<[Effect<BookingAction>; 4]>;

/// Reducer for the booking lifecycle
#[derive(Clone, Debug, Default)]
pub struct BookingReducer;

impl BookingReducer {
    /// Creates a new `BookingReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a booking about to be recorded
    fn validate_place(state: &BookingState, booking: &Booking) -> Result<(), BookingError> {
        if state.bookings.contains_key(&booking.id) {
            return Err(BookingError::PolicyViolation(format!(
                "booking {} already exists",
                booking.id
            )));
        }
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::InvalidTransition {
                from: booking.status,
                action: "place",
            });
        }
        if booking.end <= booking.start {
            return Err(BookingError::PolicyViolation(
                "booking must end after it starts".to_string(),
            ));
        }
        Ok(())
    }

    /// The booking, if its status is one of `allowed`
    fn require_status(
        state: &BookingState,
        booking_id: &BookingId,
        action: &'static str,
        allowed: &[BookingStatus],
    ) -> Result<Booking, BookingError> {
        let booking = state
            .get(booking_id)
            .ok_or_else(|| BookingError::not_found("booking", booking_id))?;
        if !allowed.contains(&booking.status) {
            return Err(BookingError::InvalidTransition {
                from: booking.status,
                action,
            });
        }
        Ok(booking.clone())
    }

    fn reject(state: &mut BookingState, error: BookingError) -> Effects {
        tracing::debug!(error = %error, "Booking command rejected");
        Self::apply_event(state, &BookingAction::TransitionRejected { error });
        SmallVec::new()
    }

    /// Applies an event to state
    fn apply_event(state: &mut BookingState, action: &BookingAction) {
        match action {
            BookingAction::BookingPlaced { booking } => {
                state.bookings.insert(booking.id.clone(), (**booking).clone());
                state.last_error = None;
            },

            BookingAction::BookingConfirmed {
                booking_id,
                confirmed_at,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.status = BookingStatus::Confirmed;
                    booking.updated_at = *confirmed_at;
                }
                state.last_error = None;
            },

            BookingAction::BookingCancelled {
                booking_id,
                cancellation,
                outcome,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.status = BookingStatus::Cancelled;
                    booking.fee_charged = outcome.fee;
                    booking.refund_due = outcome.refund;
                    booking.updated_at = cancellation.cancelled_at;
                    booking.cancellation = Some(cancellation.clone());
                }
                state.last_error = None;
            },

            BookingAction::BookingNoShow {
                booking_id,
                outcome,
                recorded_at,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.status = BookingStatus::NoShow;
                    booking.fee_charged = outcome.fee;
                    booking.refund_due = outcome.refund;
                    booking.updated_at = *recorded_at;
                }
                state.last_error = None;
            },

            BookingAction::BookingCompleted {
                booking_id,
                completed_at,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.status = BookingStatus::Completed;
                    booking.updated_at = *completed_at;
                }
                state.last_error = None;
            },

            BookingAction::BookingRescheduled {
                booking_id,
                replacement_id,
                rescheduled_at,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.status = BookingStatus::Rescheduled;
                    booking.rescheduled_to = Some(replacement_id.clone());
                    booking.updated_at = *rescheduled_at;
                }
                state.last_error = None;
            },

            BookingAction::DepositPaid {
                booking_id,
                amount,
                paid_at,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.deposit_paid = *amount;
                    booking.payment_status = PaymentStatus::Paid;
                    booking.updated_at = *paid_at;
                }
                state.last_error = None;
            },

            BookingAction::DepositFailed {
                booking_id,
                failed_at,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.payment_status = PaymentStatus::Failed;
                    booking.updated_at = *failed_at;
                }
                state.last_error = None;
            },

            BookingAction::LateDepositCaptured {
                booking_id,
                amount,
                captured_at,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.deposit_paid = *amount;
                    booking.payment_status = PaymentStatus::Paid;
                    booking.refund_due = *amount;
                    booking.updated_at = *captured_at;
                }
                state.last_error = None;
            },

            BookingAction::TransitionRejected { error } => {
                state.last_error = Some(error.clone());
            },

            BookingAction::DepositIntentOpened {
                booking_id,
                intent_id,
            } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.payment_intent_id = Some(intent_id.clone());
                }
            },

            BookingAction::ConfirmationSent { booking_id } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.confirmation_sent = true;
                }
            },

            BookingAction::RefundInitiated { booking_id, .. } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.payment_status = PaymentStatus::Refunded;
                }
            },

            BookingAction::RefundFailed { booking_id, .. } => {
                if let Some(booking) = state.bookings.get_mut(booking_id) {
                    booking.payment_status = PaymentStatus::RefundFailed;
                }
            },

            // Commands and informational feedback don't modify state
            BookingAction::Place { .. }
            | BookingAction::Confirm { .. }
            | BookingAction::Cancel { .. }
            | BookingAction::MarkNoShow { .. }
            | BookingAction::Complete { .. }
            | BookingAction::Reschedule { .. }
            | BookingAction::RecordPayment { .. }
            | BookingAction::DepositIntentFailed { .. }
            | BookingAction::ConfirmationFailed { .. }
            | BookingAction::RemindersScheduled { .. }
            | BookingAction::ReminderSchedulingFailed { .. }
            | BookingAction::RemindersCancelled { .. } => {},
        }
    }

    /// Confirm a booking already in state and ask for its confirmation and reminders
    fn confirm_booking(
        state: &mut BookingState,
        env: &BookingEnvironment,
        booking_id: &BookingId,
        recipient: Option<Recipient>,
    ) -> Effects {
        Self::apply_event(
            state,
            &BookingAction::BookingConfirmed {
                booking_id: booking_id.clone(),
                confirmed_at: env.clock.now(),
            },
        );

        match state.get(booking_id) {
            Some(booking) => smallvec![Self::confirmation_effects(env, booking.clone(), recipient)],
            None => SmallVec::new(),
        }
    }

    /// Cancel `booking` with a precomputed outcome
    fn cancel_booking(
        state: &mut BookingState,
        env: &BookingEnvironment,
        booking: &Booking,
        reason: String,
        actor: CancellationActor,
        outcome: CancellationOutcome,
    ) -> Effects {
        let cancelled_at = env.clock.now();
        Self::apply_event(
            state,
            &BookingAction::BookingCancelled {
                booking_id: booking.id.clone(),
                cancellation: Cancellation {
                    reason,
                    actor,
                    cancelled_at,
                },
                outcome,
            },
        );
        Self::settlement_effects(env, booking, outcome)
    }

    /// Effects of leaving an active state: drop reminders, refund what is owed
    fn settlement_effects(
        env: &BookingEnvironment,
        booking: &Booking,
        outcome: CancellationOutcome,
    ) -> Effects {
        let mut effects = Effects::new();
        // Only confirmed bookings ever get reminder rows
        if booking.status == BookingStatus::Confirmed {
            effects.push(Self::cancel_reminders_effect(env, booking.id.clone()));
        }
        if !outcome.refund.is_zero() {
            if let Some(intent_id) = &booking.payment_intent_id {
                effects.push(Self::refund_effect(
                    env,
                    booking.id.clone(),
                    intent_id.clone(),
                    outcome.refund,
                ));
            }
        }
        effects
    }

    /// Record a deposit that arrived after cancellation and give it all back.
    ///
    /// The cancellation outcome was settled against a zero deposit, so
    /// nothing of the captured amount is owed to the provider.
    fn refund_late_deposit(
        state: &mut BookingState,
        env: &BookingEnvironment,
        booking: &Booking,
    ) -> Effects {
        let amount = booking.deposit_amount;
        tracing::warn!(
            booking_id = %booking.id,
            amount = %amount,
            "Deposit captured for a cancelled booking, refunding"
        );
        Self::apply_event(
            state,
            &BookingAction::LateDepositCaptured {
                booking_id: booking.id.clone(),
                amount,
                captured_at: env.clock.now(),
            },
        );
        match (&booking.payment_intent_id, amount.is_zero()) {
            (Some(intent_id), false) => smallvec![Self::refund_effect(
                env,
                booking.id.clone(),
                intent_id.clone(),
                amount,
            )],
            _ => SmallVec::new(),
        }
    }

    fn deposit_intent_effect(env: &BookingEnvironment, booking: &Booking) -> Effect<BookingAction> {
        let gateway = Arc::clone(&env.gateway);
        let currency = env.currency.clone();
        let reference = booking.reference.clone();
        let booking_id = booking.id.clone();
        let amount = booking.deposit_amount.saturating_sub(booking.deposit_paid);

        Effect::future(async move {
            match gateway.open_deposit_intent(amount, &currency, &reference).await {
                Ok(intent_id) => Some(BookingAction::DepositIntentOpened {
                    booking_id,
                    intent_id,
                }),
                Err(error) => {
                    tracing::warn!(
                        booking_id = %booking_id,
                        error = %error,
                        "Deposit intent failed"
                    );
                    Some(BookingAction::DepositIntentFailed {
                        booking_id,
                        error: error.to_string(),
                    })
                },
            }
        })
    }

    fn confirmation_effects(
        env: &BookingEnvironment,
        booking: Booking,
        recipient: Option<Recipient>,
    ) -> Effect<BookingAction> {
        let notifier = Arc::clone(&env.notifier);
        let reminders = Arc::clone(&env.reminders);
        let for_reminders = booking.clone();

        let confirmation = Effect::future(async move {
            let booking_id = booking.id.clone();
            let Some(recipient) = recipient else {
                tracing::warn!(booking_id = %booking_id, "No recipient for booking confirmation");
                return Some(BookingAction::ConfirmationFailed {
                    booking_id,
                    error: "no recipient".to_string(),
                });
            };

            match notifier.send_confirmation(&booking, &recipient).await {
                Ok(()) => Some(BookingAction::ConfirmationSent { booking_id }),
                Err(error) => {
                    tracing::warn!(
                        booking_id = %booking_id,
                        error = %error,
                        "Confirmation not delivered"
                    );
                    Some(BookingAction::ConfirmationFailed {
                        booking_id,
                        error: error.to_string(),
                    })
                },
            }
        });

        let scheduling = Effect::future(async move {
            let booking_id = for_reminders.id.clone();
            match reminders.schedule_for(&for_reminders).await {
                Ok(created) => Some(BookingAction::RemindersScheduled {
                    booking_id,
                    count: created.len(),
                }),
                Err(error) => {
                    tracing::warn!(
                        booking_id = %booking_id,
                        error = %error,
                        "Reminders not scheduled"
                    );
                    Some(BookingAction::ReminderSchedulingFailed {
                        booking_id,
                        error: error.to_string(),
                    })
                },
            }
        });

        Effect::merge(vec![confirmation, scheduling])
    }

    fn cancel_reminders_effect(
        env: &BookingEnvironment,
        booking_id: BookingId,
    ) -> Effect<BookingAction> {
        let reminders = Arc::clone(&env.reminders);
        Effect::future(async move {
            match reminders.cancel_for_booking(&booking_id).await {
                Ok(count) => Some(BookingAction::RemindersCancelled { booking_id, count }),
                Err(error) => {
                    tracing::warn!(
                        booking_id = %booking_id,
                        error = %error,
                        "Reminders not cancelled"
                    );
                    None
                },
            }
        })
    }

    fn refund_effect(
        env: &BookingEnvironment,
        booking_id: BookingId,
        intent_id: PaymentIntentId,
        amount: Money,
    ) -> Effect<BookingAction> {
        let gateway = Arc::clone(&env.gateway);
        let policy = env.refund_retry.clone();

        Effect::future(async move {
            let result =
                retry_with_backoff(policy, || gateway.initiate_refund(&intent_id, amount)).await;
            match result {
                Ok(refund_id) => {
                    crate::metrics::record_refund(amount);
                    Some(BookingAction::RefundInitiated {
                        booking_id,
                        refund_id,
                        amount,
                    })
                },
                Err(error) => {
                    tracing::warn!(booking_id = %booking_id, error = %error, "Refund failed");
                    Some(BookingAction::RefundFailed {
                        booking_id,
                        error: error.to_string(),
                    })
                },
            }
        })
    }
}

impl Reducer for BookingReducer {
    type State = BookingState;
    type Action = BookingAction;
    type Environment = BookingEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per lifecycle transition
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        if action.is_command() {
            state.last_error = None;
        }

        match action {
            // ========== Place ==========
            BookingAction::Place {
                mut booking,
                recipient,
            } => {
                if let Err(error) = Self::validate_place(state, &booking) {
                    return Self::reject(state, error);
                }

                let awaiting_deposit = booking.deposit_outstanding();
                if awaiting_deposit {
                    booking.payment_status = PaymentStatus::AwaitingDeposit;
                }
                let booking_id = booking.id.clone();
                let intent = awaiting_deposit.then(|| Self::deposit_intent_effect(env, &booking));
                Self::apply_event(state, &BookingAction::BookingPlaced { booking });

                match intent {
                    Some(intent) => smallvec![intent],
                    None => Self::confirm_booking(state, env, &booking_id, recipient),
                }
            },

            // ========== Confirm ==========
            BookingAction::Confirm {
                booking_id,
                recipient,
            } => {
                let booking = match Self::require_status(
                    state,
                    &booking_id,
                    "confirm",
                    &[BookingStatus::Pending],
                ) {
                    Ok(booking) => booking,
                    Err(error) => return Self::reject(state, error),
                };
                if booking.deposit_outstanding() {
                    return Self::reject(state, BookingError::PaymentRequired);
                }
                Self::confirm_booking(state, env, &booking_id, recipient)
            },

            // ========== Cancel ==========
            BookingAction::Cancel {
                booking_id,
                reason,
                actor,
            } => {
                let booking = match Self::require_status(
                    state,
                    &booking_id,
                    "cancel",
                    &[BookingStatus::Pending, BookingStatus::Confirmed],
                ) {
                    Ok(booking) => booking,
                    Err(error) => return Self::reject(state, error),
                };
                let outcome = policy::compute_cancellation_outcome(&booking, env.clock.now());
                Self::cancel_booking(state, env, &booking, reason, actor, outcome)
            },

            // ========== No-show ==========
            BookingAction::MarkNoShow { booking_id } => {
                let booking = match Self::require_status(
                    state,
                    &booking_id,
                    "record a no-show for",
                    &[BookingStatus::Confirmed],
                ) {
                    Ok(booking) => booking,
                    Err(error) => return Self::reject(state, error),
                };
                let now = env.clock.now();
                if now <= booking.end {
                    return Self::reject(
                        state,
                        BookingError::PolicyViolation(
                            "a no-show can only be recorded after the appointment ends".to_string(),
                        ),
                    );
                }

                let outcome = policy::compute_no_show_outcome(&booking);
                Self::apply_event(
                    state,
                    &BookingAction::BookingNoShow {
                        booking_id,
                        outcome,
                        recorded_at: now,
                    },
                );
                Self::settlement_effects(env, &booking, outcome)
            },

            // ========== Complete ==========
            BookingAction::Complete { booking_id } => {
                let booking = match Self::require_status(
                    state,
                    &booking_id,
                    "complete",
                    &[BookingStatus::Confirmed],
                ) {
                    Ok(booking) => booking,
                    Err(error) => return Self::reject(state, error),
                };
                let now = env.clock.now();
                if now <= booking.end {
                    return Self::reject(
                        state,
                        BookingError::PolicyViolation(
                            "a booking can only be completed after the appointment ends"
                                .to_string(),
                        ),
                    );
                }

                Self::apply_event(
                    state,
                    &BookingAction::BookingCompleted {
                        booking_id: booking_id.clone(),
                        completed_at: now,
                    },
                );
                smallvec![Self::cancel_reminders_effect(env, booking_id)]
            },

            // ========== Reschedule ==========
            BookingAction::Reschedule {
                booking_id,
                mut replacement,
                recipient,
            } => {
                let booking = match Self::require_status(
                    state,
                    &booking_id,
                    "reschedule",
                    &[BookingStatus::Pending, BookingStatus::Confirmed],
                ) {
                    Ok(booking) => booking,
                    Err(error) => return Self::reject(state, error),
                };
                let now = env.clock.now();
                if !policy::reschedule_allowed(&booking, now) {
                    return Self::reject(
                        state,
                        BookingError::PolicyViolation(format!(
                            "rescheduling closes {} hours before the appointment",
                            booking.policy.reschedule_hours
                        )),
                    );
                }
                if let Err(error) = Self::validate_place(state, &replacement) {
                    return Self::reject(state, error);
                }

                let replacement_id = replacement.id.clone();
                Self::apply_event(
                    state,
                    &BookingAction::BookingRescheduled {
                        booking_id: booking_id.clone(),
                        replacement_id: replacement_id.clone(),
                        rescheduled_at: now,
                    },
                );

                let mut effects = Effects::new();
                if booking.status == BookingStatus::Confirmed {
                    effects.push(Self::cancel_reminders_effect(env, booking_id));
                }

                let awaiting_deposit = replacement.deposit_outstanding();
                if awaiting_deposit {
                    replacement.payment_status = PaymentStatus::AwaitingDeposit;
                    if replacement.payment_intent_id.is_none() {
                        effects.push(Self::deposit_intent_effect(env, &replacement));
                    }
                }
                Self::apply_event(
                    state,
                    &BookingAction::BookingPlaced {
                        booking: replacement,
                    },
                );

                if !awaiting_deposit {
                    effects.extend(Self::confirm_booking(state, env, &replacement_id, recipient));
                }
                effects
            },

            // ========== Payment result ==========
            BookingAction::RecordPayment {
                booking_id,
                success,
                recipient,
            } => {
                let Some(booking) = state.get(&booking_id).cloned() else {
                    return Self::reject(state, BookingError::not_found("booking", &booking_id));
                };
                if success
                    && booking.status == BookingStatus::Cancelled
                    && booking.payment_status == PaymentStatus::AwaitingDeposit
                {
                    return Self::refund_late_deposit(state, env, &booking);
                }
                if booking.status != BookingStatus::Pending
                    || booking.payment_status != PaymentStatus::AwaitingDeposit
                {
                    tracing::debug!(
                        booking_id = %booking_id,
                        status = %booking.status,
                        "Payment result ignored"
                    );
                    return SmallVec::new();
                }

                let now = env.clock.now();
                if success {
                    Self::apply_event(
                        state,
                        &BookingAction::DepositPaid {
                            booking_id: booking_id.clone(),
                            amount: booking.deposit_amount,
                            paid_at: now,
                        },
                    );
                    return Self::confirm_booking(state, env, &booking_id, recipient);
                }

                Self::apply_event(
                    state,
                    &BookingAction::DepositFailed {
                        booking_id,
                        failed_at: now,
                    },
                );
                let outcome = policy::waived(&booking);
                Self::cancel_booking(
                    state,
                    env,
                    &booking,
                    "Deposit payment failed".to_string(),
                    CancellationActor::System,
                    outcome,
                )
            },

            // ========== Deposit intent failure (compensation) ==========
            BookingAction::DepositIntentFailed { booking_id, error } => {
                let Some(booking) = state
                    .get(&booking_id)
                    .filter(|b| b.status == BookingStatus::Pending)
                    .cloned()
                else {
                    return SmallVec::new();
                };

                Self::apply_event(
                    state,
                    &BookingAction::DepositFailed {
                        booking_id,
                        failed_at: env.clock.now(),
                    },
                );
                let outcome = policy::waived(&booking);
                Self::cancel_booking(
                    state,
                    env,
                    &booking,
                    format!("Deposit intent failed: {error}"),
                    CancellationActor::System,
                    outcome,
                )
            },

            // ========== Events and feedback ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
